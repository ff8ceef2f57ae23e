//! End-to-end co-simulation: supervisor, invoker, recovery policy.

use std::sync::Arc;

use crate::DEFAULT_SERVICE_PORT;
use crate::detection::{DEFAULT_BOX_SIDE, DetectionResult};
use crate::fallback::{FallbackTable, RecoveryPolicy, ResolveError};
use crate::invoker::{InvokeError, Simulator};
use crate::job::SimulationJob;
use crate::supervisor::{ServiceHandle, ServiceState, ServiceSupervisor, StartError, StopError};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Port the classification service listens on.
    pub port: u16,
    pub box_side: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVICE_PORT,
            box_side: DEFAULT_BOX_SIDE,
        }
    }
}

impl PipelineConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_box_side(mut self, side: u32) -> Self {
        self.box_side = side;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl PipelineError {
    /// Captured process output that explains the failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Start(e) => e.diagnostics(),
            Self::Resolve(ResolveError::HardFailure { diagnostics, .. }) => Some(diagnostics),
            _ => None,
        }
    }
}

/// Owns the classification service across jobs and turns each
/// [`SimulationJob`] into a [`DetectionResult`].
pub struct CoSimulation {
    config: PipelineConfig,
    supervisor: ServiceSupervisor,
    simulator: Arc<dyn Simulator>,
    policy: RecoveryPolicy,
    service: Option<ServiceHandle>,
}

impl CoSimulation {
    pub fn new(
        config: PipelineConfig,
        supervisor: ServiceSupervisor,
        simulator: Arc<dyn Simulator>,
        table: Arc<FallbackTable>,
    ) -> Self {
        let policy = RecoveryPolicy::new(table).with_box_side(config.box_side);
        Self {
            config,
            supervisor,
            simulator,
            policy,
            service: None,
        }
    }

    pub fn service(&self) -> Option<&ServiceHandle> {
        self.service.as_ref()
    }

    /// Make sure the classification service is reachable, restarting it when
    /// the previous one died or stopped answering.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if let Some(handle) = self.service.as_mut()
            && self.supervisor.refresh(handle).await == ServiceState::Running
        {
            return Ok(());
        }

        if let Some(stale) = self.service.as_mut()
            && let Err(e) = self.supervisor.stop(stale).await
        {
            tracing::warn!(error = %e, "Failed to reap previous classification service");
        }

        let handle = self.supervisor.ensure_running(self.config.port).await?;
        self.service = Some(handle);
        Ok(())
    }

    pub async fn process(&mut self, job: &SimulationJob) -> Result<DetectionResult, PipelineError> {
        self.start().await?;

        let outcome = self.simulator.run(job).await?;
        let result = self.policy.resolve(job, &outcome)?;

        tracing::info!(
            job_id = job.id(),
            detected = result.is_detected(),
            origin = result.origin().as_str(),
            "Job finished"
        );
        Ok(result)
    }

    /// Stop the service if this pipeline started it.
    pub async fn shutdown(&mut self) -> Result<(), StopError> {
        match self.service.as_mut() {
            Some(handle) => self.supervisor.stop(handle).await,
            None => Ok(()),
        }
    }
}
