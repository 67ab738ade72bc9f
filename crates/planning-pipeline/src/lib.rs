//! Planning Pipeline
//!
//! Turns human-authored markdown plans into validated, scored work:
//! - Plan parsing (two markdown dialects) into a dependency graph of steps
//! - Decomposition into atomic units with acceptance criteria
//! - Real file/command execution with sandbox confinement and backups
//! - Acceptance validation, quality scoring, and model routing
//! - Checkpoint-based recovery and a deterministic phase machine
//!
//! Service integration goes through typed bridges with local fallback, so
//! offline pipelines are indistinguishable at the interface.

pub mod bridges;
pub mod checkpoint;
pub mod decomposer;
pub mod executor;
pub mod orchestrator;
pub mod parser;
pub mod router;
pub mod validator;

pub use bridges::data::{DataBridge, StoreResult, StoreResultType};
pub use bridges::mesh::{EventType, MeshBridge, PublishResult};
pub use bridges::model::{GeneratedPlan, ModelPort, ModelProvider, OfflineModelBridge};
pub use bridges::scoring::{
    AssessmentLevel, PlanScore, ScoreDimension, ScoringBridge, UnitScore,
};
pub use bridges::Bridge;
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use decomposer::{AtomicUnit, Complexity, Criterion, SpecDecomposer};
pub use executor::{CommandResult, ExecutionResult, ExecutionStatus, ExecutionType, UnitExecutor};
pub use orchestrator::{
    CancelHandle, CancelSignal, ExecutionContext, PipelineOrchestrator, PipelineResult,
    PipelineStatus, UnitResult,
};
pub use parser::{ParsedPlan, ParsedStep, PlanFormat, PlanParser};
pub use router::{
    ComplexityLevel, EscalationResult, ModelRouter, RouterConfig, RoutingDecision,
    RoutingStrategy, TaskCategory,
};
pub use validator::{CriterionResult, UnitValidator, ValidationResult, ValidationStatus};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Working directory already owned by execution {owner}: {dir}")]
    WorkingDirBusy { dir: PathBuf, owner: String },

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] workflow_store::StoreError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] service_mesh::IntegrationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
