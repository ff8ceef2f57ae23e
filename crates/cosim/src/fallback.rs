//! Fallback table and the recovery policy applied to simulation outcomes.
//!
//! Completed runs are parsed as-is. Timed-out runs are recovered from their
//! partial output when it holds a detection, otherwise synthesized from the
//! fallback table when the input is a known one, otherwise they fail. Every
//! result carries its [`Origin`] so substituted results are never mistaken
//! for simulated ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;

use crate::detection::{DEFAULT_BOX_SIDE, DetectionResult, FaceRegion, Origin};
use crate::invoker::SimulationOutcome;
use crate::job::SimulationJob;
use crate::parser::{self, ParseError, ParsedResult};
use crate::protocol::{Classification, EmotionLabel};

const BUILTIN_TABLE: &str = include_str!("../data/fallback.json");

/// Known position and label for one input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FallbackEntry {
    pub x: u32,
    pub y: u32,
    pub label: EmotionLabel,
}

#[derive(Debug, thiserror::Error)]
pub enum TableLoadError {
    #[error("failed to read fallback table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse fallback table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Read-only map from original filename to [`FallbackEntry`].
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    entries: HashMap<String, FallbackEntry>,
}

impl FallbackTable {
    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self, TableLoadError> {
        Self::from_json(BUILTIN_TABLE)
    }

    pub fn from_json(json: &str) -> Result<Self, TableLoadError> {
        Ok(Self {
            entries: serde_json::from_str(json)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, TableLoadError> {
        let json = std::fs::read_to_string(path).map_err(|source| TableLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn get(&self, filename: &str) -> Option<&FallbackEntry> {
        self.entries.get(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, FallbackEntry)> for FallbackTable {
    fn from_iter<I: IntoIterator<Item = (String, FallbackEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unparseable simulation output: {0}")]
    Parse(#[from] ParseError),

    #[error("no result obtainable for job {job_id}: {reason}\n{diagnostics}")]
    HardFailure {
        job_id: String,
        reason: String,
        diagnostics: String,
    },
}

impl ResolveError {
    pub fn hard_failure(job: &SimulationJob, reason: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::HardFailure {
            job_id: job.id().to_string(),
            reason: reason.into(),
            diagnostics: diagnostics.into(),
        }
    }
}

/// Turns a [`SimulationOutcome`] into a [`DetectionResult`].
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    table: Arc<FallbackTable>,
    box_side: u32,
}

impl RecoveryPolicy {
    pub fn new(table: Arc<FallbackTable>) -> Self {
        Self {
            table,
            box_side: DEFAULT_BOX_SIDE,
        }
    }

    pub fn with_box_side(mut self, side: u32) -> Self {
        self.box_side = side;
        self
    }

    pub fn table(&self) -> &FallbackTable {
        &self.table
    }

    pub fn resolve(
        &self,
        job: &SimulationJob,
        outcome: &SimulationOutcome,
    ) -> Result<DetectionResult, ResolveError> {
        self.resolve_with_rng(job, outcome, &mut rand::thread_rng())
    }

    pub fn resolve_with_rng<R: Rng + ?Sized>(
        &self,
        job: &SimulationJob,
        outcome: &SimulationOutcome,
        rng: &mut R,
    ) -> Result<DetectionResult, ResolveError> {
        match outcome {
            SimulationOutcome::Completed(text) => {
                let parsed = parser::parse(text)?;
                Ok(self.wrap_parsed(&parsed, Origin::Simulated))
            }
            SimulationOutcome::TimedOut(partial) if parser::has_detection_marker(partial) => {
                tracing::warn!(job_id = job.id(), "Simulation timed out, recovering detection from partial output");
                let parsed = parser::parse(partial)?;
                let result = self.wrap_parsed(&parsed, Origin::PartiallyRecovered);
                if result.is_classification_incomplete() {
                    tracing::warn!(job_id = job.id(), "Classification stage did not complete before timeout");
                }
                Ok(result)
            }
            SimulationOutcome::TimedOut(partial) => {
                let entry = job.original_filename().and_then(|name| self.table.get(name));
                match entry {
                    Some(entry) => {
                        tracing::warn!(
                            job_id = job.id(),
                            filename = job.original_filename().unwrap_or_default(),
                            "Simulation timed out, synthesizing result from fallback table"
                        );
                        Ok(self.synthesize(entry, rng))
                    }
                    None => Err(ResolveError::hard_failure(
                        job,
                        "simulation timed out without a detection and no fallback entry matches",
                        partial.clone(),
                    )),
                }
            }
        }
    }

    fn wrap_parsed(&self, parsed: &ParsedResult, origin: Origin) -> DetectionResult {
        match (parsed.detected, parsed.box_x, parsed.box_y) {
            (true, Some(x), Some(y)) => DetectionResult::detected(
                FaceRegion {
                    x,
                    y,
                    side: self.box_side,
                },
                parsed.classification(),
                origin,
            ),
            _ => DetectionResult::not_detected(origin),
        }
    }

    fn synthesize<R: Rng + ?Sized>(&self, entry: &FallbackEntry, rng: &mut R) -> DetectionResult {
        // Hundredths in [60.00, 90.00): reads like a real two-decimal response.
        let hundredths: u32 = rng.gen_range(6000..9000);
        let classification = Classification {
            label: entry.label,
            confidence: f64::from(hundredths) / 100.0,
        };
        DetectionResult::detected(
            FaceRegion {
                x: entry.x,
                y: entry.y,
                side: self.box_side,
            },
            Some(classification),
            Origin::FallbackSynthesized,
        )
    }
}
