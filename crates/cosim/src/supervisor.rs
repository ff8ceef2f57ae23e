//! Service supervisor - manages the classification service process.
//!
//! Flow:
//! 1. Probe the port; a listener that answers is adopted as externally owned
//! 2. Otherwise spawn the service and wait a grace interval
//! 3. Process still alive: Running, its output drained into tracing
//! 4. Process already exited: CrashedOnStartup with its captured output
//!
//! Stop is SIGTERM, bounded wait, then SIGKILL. It never touches a process
//! this supervisor did not spawn, and is a no-op once stopped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::capture::{Echo, OutputCapture};

/// Lifecycle of a [`ServiceHandle`].
///
/// `NotStarted` and `Starting` are transitional: they are held only while
/// [`ServiceSupervisor::ensure_running`] works on a handle and appear in its
/// logs, never on a returned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

enum Ownership {
    /// Spawned by this supervisor. `None` once reaped.
    Owned(Option<Child>),
    /// Found already listening; never signalled.
    External,
}

/// The classification service as seen by the orchestrator.
pub struct ServiceHandle {
    host: String,
    port: u16,
    state: ServiceState,
    pid: Option<u32>,
    ownership: Ownership,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl ServiceHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Process id when this supervisor spawned the service.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to spawn classification service: {0}")]
    Spawn(#[from] SpawnError),

    #[error("classification service exited during startup ({status}):\n{output}")]
    CrashedOnStartup { status: String, output: String },

    #[error("failed to check classification service liveness: {0}")]
    Liveness(#[source] std::io::Error),
}

impl StartError {
    pub fn crashed(status: impl Into<String>, output: impl Into<String>) -> Self {
        Self::CrashedOnStartup {
            status: status.into(),
            output: output.into(),
        }
    }

    /// Captured diagnostics, when the process got far enough to produce any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::CrashedOnStartup { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("failed to signal classification service: {0}")]
    Signal(String),

    #[error("failed to reap classification service: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ServiceSpawnConfig {
    pub host: String,
    pub port: u16,
}

/// Extension point for how the service process is started.
pub trait ServiceSpawner: Send + Sync {
    /// Build the command for one service instance. The supervisor sets up
    /// pipes and process options.
    fn command(&self, config: &ServiceSpawnConfig) -> Result<Command, SpawnError>;
}

/// Re-executes a `cosim` binary as `<program> serve --host <h> --port <p>`.
pub struct CosimSpawner {
    program: PathBuf,
    model: Option<PathBuf>,
    read_payload: bool,
}

impl CosimSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            model: None,
            read_payload: false,
        }
    }

    /// Spawner for the running executable.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_model(mut self, model: Option<PathBuf>) -> Self {
        self.model = model;
        self
    }

    pub fn with_read_payload(mut self, read_payload: bool) -> Self {
        self.read_payload = read_payload;
        self
    }
}

impl ServiceSpawner for CosimSpawner {
    fn command(&self, config: &ServiceSpawnConfig) -> Result<Command, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("serve")
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string());
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        if self.read_payload {
            cmd.arg("--read-payload");
        }
        Ok(cmd)
    }
}

pub struct SupervisorConfig {
    pub host: String,
    pub probe_timeout: Duration,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
    pub spawner: Arc<dyn ServiceSpawner>,
}

impl SupervisorConfig {
    pub fn new(spawner: Arc<dyn ServiceSpawner>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            probe_timeout: Duration::from_millis(500),
            startup_grace: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
            spawner,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

pub struct ServiceSupervisor {
    config: SupervisorConfig,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// True when something accepts TCP connections on `port`.
    pub async fn probe(&self, port: u16) -> bool {
        let addr = (self.config.host.as_str(), port);
        matches!(
            tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Adopt a listening service or start one on `port`.
    pub async fn ensure_running(&self, port: u16) -> Result<ServiceHandle, StartError> {
        let mut handle = ServiceHandle {
            host: self.config.host.clone(),
            port,
            state: ServiceState::NotStarted,
            pid: None,
            ownership: Ownership::External,
        };

        if self.probe(port).await {
            tracing::info!(port, "Port already answering, adopting running classification service");
            handle.state = ServiceState::Running;
            return Ok(handle);
        }

        handle.state = ServiceState::Starting;
        tracing::info!(port, state = handle.state.as_str(), "Starting classification service");

        let spawn_config = ServiceSpawnConfig {
            host: self.config.host.clone(),
            port,
        };
        let mut child = self
            .config
            .spawner
            .command(&spawn_config)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::from)?;
        handle.pid = child.id();

        let capture = OutputCapture::attach(&mut child, Echo::Service);
        tokio::time::sleep(self.config.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {
                capture.detach();
                handle.ownership = Ownership::Owned(Some(child));
                handle.state = ServiceState::Running;
                tracing::info!(port, pid = ?handle.pid, "Classification service started");
                Ok(handle)
            }
            Ok(Some(status)) => {
                handle.state = ServiceState::Failed;
                let output = capture.finish(self.config.stop_timeout).await;
                tracing::error!(port, %status, "Classification service exited during startup");
                Err(StartError::crashed(status.to_string(), output))
            }
            Err(e) => {
                handle.state = ServiceState::Failed;
                Err(StartError::Liveness(e))
            }
        }
    }

    /// Re-check a running handle before reuse. An owned child that has
    /// exited, or a port that no longer answers, marks the handle `Failed`.
    pub async fn refresh(&self, handle: &mut ServiceHandle) -> ServiceState {
        if handle.state != ServiceState::Running {
            return handle.state;
        }

        if let Ownership::Owned(slot) = &mut handle.ownership
            && let Some(child) = slot.as_mut()
        {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    tracing::warn!(port = handle.port, %status, "Classification service exited");
                    *slot = None;
                    handle.state = ServiceState::Failed;
                    return handle.state;
                }
                Err(e) => {
                    tracing::warn!(port = handle.port, error = %e, "Failed to check classification service");
                }
            }
        }

        if !self.probe(handle.port).await {
            tracing::warn!(port = handle.port, "Classification service no longer answering");
            handle.state = ServiceState::Failed;
        }
        handle.state
    }

    /// Stop a service this supervisor spawned. Adopted or already-stopped
    /// handles are left alone.
    pub async fn stop(&self, handle: &mut ServiceHandle) -> Result<(), StopError> {
        let child = match &mut handle.ownership {
            Ownership::External => {
                tracing::debug!(port = handle.port, "Not stopping externally owned service");
                return Ok(());
            }
            Ownership::Owned(child) => child.take(),
        };
        let Some(mut child) = child else {
            return Ok(());
        };

        handle.state = ServiceState::Stopping;
        tracing::info!(port = handle.port, pid = ?handle.pid, "Stopping classification service");

        let result = self.terminate(&mut child).await;
        handle.state = ServiceState::Stopped;
        result
    }

    async fn terminate(&self, child: &mut Child) -> Result<(), StopError> {
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(%status, "Classification service already exited");
            return Ok(());
        }

        send_terminate(child)?;

        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Classification service stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(StopError::Wait(e)),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Classification service ignored SIGTERM, killing"
                );
                child.kill().await.map_err(StopError::Wait)
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> Result<(), StopError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| StopError::Signal(e.to_string()))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(StopError::Signal(e.to_string())),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> Result<(), StopError> {
    child
        .start_kill()
        .map_err(|e| StopError::Signal(e.to_string()))
}
