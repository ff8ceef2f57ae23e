//! Combined stdout/stderr capture for child processes.
//!
//! Both pipes are drained concurrently into one shared buffer, line by line,
//! so the text can be snapshotted at any time (a timed-out job keeps whatever
//! arrived before the kill). Interleaving between the two streams is
//! arrival order, not emission order.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// What to do with each captured line besides buffering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Silent,
    /// Re-emit as an `info` event under the `cosim::service` target.
    Service,
}

struct Captured {
    text: String,
    /// Cleared on detach; later lines are only echoed.
    retain: bool,
}

type SharedCapture = Arc<StdMutex<Captured>>;

fn lock(shared: &SharedCapture) -> std::sync::MutexGuard<'_, Captured> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct OutputCapture {
    buffer: SharedCapture,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Take the child's piped stdout/stderr (whichever were captured) and
    /// start draining them.
    pub fn attach(child: &mut Child, echo: Echo) -> Self {
        let buffer = Arc::new(StdMutex::new(Captured {
            text: String::new(),
            retain: true,
        }));
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StreamSource::Stdout, Arc::clone(&buffer), echo));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StreamSource::Stderr, Arc::clone(&buffer), echo));
        }

        Self { buffer, readers }
    }

    /// Text captured so far.
    pub fn snapshot(&self) -> String {
        lock(&self.buffer).text.clone()
    }

    /// Wait up to `grace` for both pipes to reach EOF, then return the text.
    ///
    /// Readers still running after `grace` (a grandchild holding the pipe
    /// open) are aborted; their text up to that point is kept.
    pub async fn finish(self, grace: Duration) -> String {
        let Self { buffer, readers } = self;
        let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();

        let drained = tokio::time::timeout(grace, futures::future::join_all(readers)).await;
        if drained.is_err() {
            tracing::debug!("Output readers still open after grace period, aborting");
            for handle in aborts {
                handle.abort();
            }
        }

        let text = lock(&buffer).text.clone();
        text
    }

    /// Keep draining in the background (for long-lived children) without
    /// buffering further output.
    pub fn detach(self) {
        let mut captured = lock(&self.buffer);
        captured.retain = false;
        captured.text = String::new();
    }
}

fn spawn_reader<R>(
    pipe: R,
    source: StreamSource,
    buffer: SharedCapture,
    echo: Echo,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    if echo == Echo::Service {
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            tracing::info!(target: "cosim::service", source = source.as_str(), "{}", trimmed);
                        }
                    }
                    let mut captured = lock(&buffer);
                    if captured.retain {
                        captured.text.push_str(&line);
                        if !line.ends_with('\n') {
                            captured.text.push('\n');
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(source = source.as_str(), error = %e, "Output pipe read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let mut child = sh("echo out-line; echo err-line >&2; printf 'no-newline'");
        let capture = OutputCapture::attach(&mut child, Echo::Silent);
        child.wait().await.unwrap();
        let text = capture.finish(Duration::from_secs(2)).await;

        assert!(text.contains("out-line\n"));
        assert!(text.contains("err-line\n"));
        assert!(text.contains("no-newline\n"));
    }

    #[tokio::test]
    async fn snapshot_sees_text_before_exit() {
        let mut child = sh("echo early; sleep 5");
        let capture = OutputCapture::attach(&mut child, Echo::Silent);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !capture.snapshot().contains("early") {
            assert!(tokio::time::Instant::now() < deadline, "no output captured");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        child.kill().await.unwrap();
        let text = capture.finish(Duration::from_millis(100)).await;
        assert_eq!(text, "early\n");
    }
}
