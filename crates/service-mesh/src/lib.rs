//! Service Mesh Core
//!
//! Inter-service plumbing for the platform:
//! - Service registry with health tracking
//! - Per-target circuit breakers
//! - Request orchestration with trace propagation
//! - Event routing from the store bus to downstream layers with DLQ + retry
//! - Saga orchestration with compensation

pub mod circuit;
pub mod context;
pub mod event_router;
pub mod orchestrator;
pub mod registry;
pub mod saga;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use context::{ErrorEnvelope, RequestContext};
pub use event_router::{EventRouter, EventRouterConfig, RouterHealth, RouterMetrics};
pub use orchestrator::RequestOrchestrator;
pub use registry::{ServiceInstance, ServiceRegistry, ServiceStatus};
pub use saga::{
    Saga, SagaAction, SagaOrchestrator, SagaStatus, SagaStep, SagaStepDef, StepExecutor,
    StepStatus,
};

use std::time::Duration;
use thiserror::Error;

/// Errors crossing the mesh boundary. Codes are a stable vocabulary shared
/// with every layer's error envelope.
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("[E11001] Service not found: {0}")]
    ServiceNotFound(String),

    #[error("[E11101] Circuit open for service: {0}")]
    CircuitOpen(String),

    #[error("[E11200] Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("[E11300] Remote error ({status}): {message}")]
    RemoteError { status: u16, message: String },

    #[error("[E11301] Connect failure: {0}")]
    ConnectFailure(String),

    #[error("[E11302] Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Orchestrator not started")]
    NotStarted,

    #[error("Saga error: {0}")]
    Saga(String),

    #[error("Store error: {0}")]
    Store(#[from] workflow_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntegrationError {
    /// Stable error code for the user-visible envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound(_) => "E11001",
            Self::CircuitOpen(_) => "E11101",
            Self::RemoteRejected { .. } => "E11200",
            Self::RemoteError { .. } => "E11300",
            Self::ConnectFailure(_) => "E11301",
            Self::Timeout(_) => "E11302",
            Self::NotStarted | Self::Saga(_) | Self::Store(_) | Self::Serialization(_) => {
                "E11500"
            }
        }
    }
}
