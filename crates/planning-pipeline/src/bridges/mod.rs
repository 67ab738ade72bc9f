//! Typed adapters between the pipeline and its collaborator layers.
//!
//! Every bridge exposes the same lifecycle (`initialize`, `close`,
//! `is_connected`, `get_statistics`) and keeps working through a local
//! fallback when its remote is unreachable, so tests and offline pipelines
//! are indistinguishable at the interface.

pub mod data;
pub mod mesh;
pub mod model;
pub mod scoring;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Bridge: Send + Sync {
    async fn initialize(&self);
    async fn close(&self);
    fn is_connected(&self) -> bool;
    fn get_statistics(&self) -> Value;
}
