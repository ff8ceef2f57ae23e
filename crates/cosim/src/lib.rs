//! cosim: co-simulation orchestrator for a hardware face detector and its
//! emotion classification service.
//!
//! A detection simulation runs under a deadline while a classification
//! service answers the single ROI request it makes mid-run. The simulation's
//! diagnostic text is parsed into a [`DetectionResult`]; timeouts are
//! recovered from partial output or the fallback table.

pub mod backend;
pub mod capture;
pub mod client;
pub mod codec;
pub mod detection;
pub mod fallback;
pub mod invoker;
pub mod job;
pub mod parser;
pub mod pipeline;
pub mod protocol;
pub mod service;
pub mod supervisor;

/// Port the classification service listens on unless configured otherwise.
pub const DEFAULT_SERVICE_PORT: u16 = 8888;

pub use backend::{Classifier, MockClassifier, ModelClassifier, ModelLoadError, select_backend};
pub use client::{ClientError, RoiClient};
pub use codec::{ProtocolError, RoiCodec};
pub use detection::{DEFAULT_BOX_SIDE, DetectionResult, FaceRegion, Origin};
pub use fallback::{FallbackEntry, FallbackTable, RecoveryPolicy, ResolveError, TableLoadError};
pub use invoker::{InvokeError, SimulationInvoker, SimulationOutcome, Simulator, SimulatorConfig};
pub use job::SimulationJob;
pub use parser::{ParseError, ParsedResult};
pub use pipeline::{CoSimulation, PipelineConfig, PipelineError};
pub use protocol::{Classification, ClassificationResponse, EmotionLabel, RoiRequest};
pub use service::ServiceConfig;
pub use supervisor::{
    CosimSpawner, ServiceHandle, ServiceSpawner, ServiceState, ServiceSupervisor, StartError,
    StopError, SupervisorConfig,
};
