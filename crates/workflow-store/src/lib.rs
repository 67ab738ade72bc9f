//! Workflow Store - Event-Sourced Persistence Layer
//!
//! This crate provides the data layer for the workflow orchestration system:
//! - Workflow definitions (CRUD, versioning, soft-archive)
//! - Workflow executions (lifecycle, checkpointing, compensation state)
//! - Node executions (individual step tracking)
//! - Triggers (event, schedule, webhook)
//! - Approval requests (human-in-the-loop gating)
//! - Append-only event log with change notifications on a pub/sub channel

pub mod bus;
pub mod event_store;
pub mod models;
pub mod store;

pub use bus::{EventBus, LocalEventBus, EVENTS_CHANNEL};
pub use event_store::{EventQuery, EventStore};
pub use models::*;
pub use store::WorkflowStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Event bus error: {0}")]
    Bus(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Generates a prefixed identifier from a fresh UUID, e.g. `exec_a1b2c3d4e5f6`.
pub(crate) fn tag_id(prefix: &str, hex_len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..hex_len])
}
