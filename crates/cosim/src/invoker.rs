//! Simulation invoker - runs one detection simulation under a deadline.
//!
//! The prepared pixel file is copied to the fixed path the simulation reads,
//! the simulation is launched with stdout and stderr captured into one
//! stream, and its completion is raced against the job's timeout. The
//! invoker only classifies the process-level outcome; whether the text holds
//! a result is decided by the parser.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::capture::{Echo, OutputCapture};
use crate::job::SimulationJob;

/// Default wall-clock budget for one simulation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to keep reading pipes after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Process-level result of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    /// Exited before the deadline (any exit code) with its full output.
    Completed(String),
    /// Killed at the deadline; whatever output arrived before the kill.
    TimedOut(String),
}

impl SimulationOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Completed(text) | Self::TimedOut(text) => text,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("failed to stage {from} as {to}: {source}")]
    Stage {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch simulation `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for simulation: {0}")]
    Wait(#[source] std::io::Error),
}

/// Anything that can run a [`SimulationJob`] to an outcome.
///
/// The pipeline only depends on this trait, so it can be exercised without a
/// simulator installed.
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn run(&self, job: &SimulationJob) -> Result<SimulationOutcome, InvokeError>;
}

/// Where and how the simulation executable is launched.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the simulation.
    pub sim_dir: PathBuf,
    /// Path, relative to `sim_dir`, the prepared pixel file is copied to.
    pub staged_input: PathBuf,
}

impl SimulatorConfig {
    /// `vvp -M<vpi_dir> -mverilog_python_interface run_sim`, run from `sim_dir`.
    ///
    /// A relative `vpi_dir` is resolved against the current directory, since
    /// vvp itself runs from `sim_dir`.
    pub fn vvp(sim_dir: impl Into<PathBuf>, vpi_dir: &Path) -> Self {
        let vpi_dir = std::path::absolute(vpi_dir).unwrap_or_else(|_| vpi_dir.to_path_buf());
        Self {
            program: "vvp".to_string(),
            args: vec![
                format!("-M{}", vpi_dir.display()),
                "-mverilog_python_interface".to_string(),
                "run_sim".to_string(),
            ],
            sim_dir: sim_dir.into(),
            staged_input: PathBuf::from("image.txt"),
        }
    }

    pub fn new(program: impl Into<String>, sim_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sim_dir: sim_dir.into(),
            staged_input: PathBuf::from("image.txt"),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_staged_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.staged_input = path.into();
        self
    }

    pub fn staged_input_path(&self) -> PathBuf {
        self.sim_dir.join(&self.staged_input)
    }
}

pub struct SimulationInvoker {
    config: SimulatorConfig,
}

impl SimulationInvoker {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    async fn stage(&self, job: &SimulationJob) -> Result<(), InvokeError> {
        let to = self.config.staged_input_path();
        tokio::fs::copy(job.pixel_path(), &to)
            .await
            .map_err(|source| InvokeError::Stage {
                from: job.pixel_path().to_path_buf(),
                to,
                source,
            })?;
        Ok(())
    }

    fn spawn(&self) -> Result<Child, InvokeError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&self.config.sim_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout can take down helpers too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|source| InvokeError::Spawn {
            program: self.config.program.clone(),
            source,
        })
    }
}

#[async_trait]
impl Simulator for SimulationInvoker {
    async fn run(&self, job: &SimulationJob) -> Result<SimulationOutcome, InvokeError> {
        self.stage(job).await?;

        tracing::info!(
            job_id = job.id(),
            program = %self.config.program,
            args = ?self.config.args,
            timeout_ms = job.timeout().as_millis() as u64,
            "Running simulation"
        );

        let mut child = self.spawn()?;
        let capture = OutputCapture::attach(&mut child, Echo::Silent);

        match tokio::time::timeout(job.timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                let text = capture.finish(DRAIN_GRACE).await;
                tracing::info!(job_id = job.id(), %status, bytes = text.len(), "Simulation finished");
                Ok(SimulationOutcome::Completed(text))
            }
            Ok(Err(e)) => Err(InvokeError::Wait(e)),
            Err(_) => {
                tracing::warn!(
                    job_id = job.id(),
                    timeout_ms = job.timeout().as_millis() as u64,
                    "Simulation timed out, killing"
                );
                kill_tree(&mut child).await;
                let text = capture.finish(DRAIN_GRACE).await;
                Ok(SimulationOutcome::TimedOut(text))
            }
        }
    }
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            tracing::debug!(pid, error = %e, "killpg failed, falling back to kill");
        }
    }

    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Simulation already exited");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn setup(script: &str) -> (tempfile::TempDir, SimulationInvoker, SimulationJob) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("face_prepared.txt");
        std::fs::write(&input, "7f\n80\n").unwrap();

        let config = SimulatorConfig::new("sh", dir.path()).with_args(["-c", script]);
        let job = SimulationJob::new(&input).with_timeout(Duration::from_millis(500));
        (dir, SimulationInvoker::new(config), job)
    }

    #[test]
    fn vvp_command_line() {
        let config = SimulatorConfig::vvp("/work/sim", Path::new("/work/vpi"));
        assert_eq!(config.program, "vvp");
        assert_eq!(
            config.args,
            ["-M/work/vpi", "-mverilog_python_interface", "run_sim"]
        );
        assert_eq!(config.staged_input_path(), PathBuf::from("/work/sim/image.txt"));
    }

    #[test]
    fn vvp_resolves_relative_vpi_dir() {
        let config = SimulatorConfig::vvp("sim", Path::new("vpi"));
        let expected = std::env::current_dir().unwrap().join("vpi");
        assert_eq!(config.args[0], format!("-M{}", expected.display()));
        assert_eq!(config.sim_dir, PathBuf::from("sim"));
    }

    #[tokio::test]
    async fn completed_captures_combined_output_and_stages_input() {
        let (_dir, invoker, job) =
            setup("echo \"staged $(head -n 1 image.txt)\"; echo 'Face detected at (5, 7)' >&2");
        let outcome = invoker.run(&job).await.unwrap();

        match outcome {
            SimulationOutcome::Completed(text) => {
                assert!(text.contains("staged 7f"), "{text}");
                assert!(text.contains("Face detected at (5, 7)"), "{text}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_still_completed() {
        let (_dir, invoker, job) = setup("echo 'Face detected at (1, 2)'; exit 4");
        let outcome = invoker.run(&job).await.unwrap();
        assert_eq!(
            outcome,
            SimulationOutcome::Completed("Face detected at (1, 2)\n".to_string())
        );
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let (_dir, invoker, job) = setup("echo 'Face detected at (24, 20)'; sleep 30");
        let started = tokio::time::Instant::now();
        let outcome = invoker.run(&job).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            outcome,
            SimulationOutcome::TimedOut("Face detected at (24, 20)\n".to_string())
        );
    }

    #[tokio::test]
    async fn timeout_with_no_output_is_empty() {
        let (_dir, invoker, job) = setup("sleep 30");
        let outcome = invoker.run(&job).await.unwrap();
        assert_eq!(outcome, SimulationOutcome::TimedOut(String::new()));
    }

    #[tokio::test]
    async fn missing_input_is_stage_error() {
        let (dir, invoker, _job) = setup("true");
        let job = SimulationJob::new(dir.path().join("missing.txt"));
        assert!(matches!(
            invoker.run(&job).await,
            Err(InvokeError::Stage { .. })
        ));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let (dir, _invoker, job) = setup("true");
        let invoker = SimulationInvoker::new(SimulatorConfig::new("/nonexistent/vvp", dir.path()));
        assert!(matches!(
            invoker.run(&job).await,
            Err(InvokeError::Spawn { .. })
        ));
    }
}
