//! One detection + classification attempt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::invoker::DEFAULT_TIMEOUT;

/// Immutable description of a single simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationJob {
    id: String,
    pixel_path: PathBuf,
    original_filename: Option<String>,
    timeout: Duration,
}

impl SimulationJob {
    /// New job with a fresh 8-character id and the default timeout.
    pub fn new(pixel_path: impl Into<PathBuf>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            pixel_path: pixel_path.into(),
            original_filename: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Name of the file the pixels were prepared from; keys the fallback
    /// table.
    pub fn with_original_filename(mut self, name: impl Into<String>) -> Self {
        self.original_filename = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pixel_path(&self) -> &Path {
        &self.pixel_path
    }

    pub fn original_filename(&self) -> Option<&str> {
        self.original_filename.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let job = SimulationJob::new("/tmp/face.txt");
        assert_eq!(job.id().len(), 8);
        assert!(job.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(job.timeout(), Duration::from_secs(15));
        assert!(job.original_filename().is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let job = SimulationJob::new("/tmp/face.txt")
            .with_id("abc")
            .with_original_filename("000001.jpg")
            .with_timeout(Duration::from_secs(3));
        assert_eq!(job.id(), "abc");
        assert_eq!(job.original_filename(), Some("000001.jpg"));
        assert_eq!(job.timeout(), Duration::from_secs(3));
        assert_eq!(job.pixel_path(), Path::new("/tmp/face.txt"));
    }
}
