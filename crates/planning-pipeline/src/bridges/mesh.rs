//! Mesh bridge: event publication, sagas, and circuit breakers.
//!
//! Connected, events go through the store's event log (which fans them out
//! on the bus); disconnected, they land in a local log with the same
//! interface, so offline pipelines and tests see identical behavior.

use crate::bridges::Bridge;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_mesh::{CircuitBreaker, Saga, SagaOrchestrator, SagaStepDef};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workflow_store::{EventCreate, EventStore};

/// Lifecycle events the pipeline publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlanStarted,
    PlanCompleted,
    PlanFailed,
    UnitStarted,
    UnitCompleted,
    UnitFailed,
    CheckpointCreated,
    RollbackStarted,
    RollbackCompleted,
    ValidationPassed,
    ValidationFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanStarted => "plan.started",
            Self::PlanCompleted => "plan.completed",
            Self::PlanFailed => "plan.failed",
            Self::UnitStarted => "unit.started",
            Self::UnitCompleted => "unit.completed",
            Self::UnitFailed => "unit.failed",
            Self::CheckpointCreated => "checkpoint.created",
            Self::RollbackStarted => "rollback.started",
            Self::RollbackCompleted => "rollback.completed",
            Self::ValidationPassed => "validation.passed",
            Self::ValidationFailed => "validation.failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub event_id: String,
    pub remote: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct MeshBridge {
    events: Option<Arc<EventStore>>,
    sagas: Option<Arc<SagaOrchestrator>>,
    breaker: Arc<CircuitBreaker>,
    local_events: Mutex<Vec<LocalEvent>>,
    initialized: AtomicBool,
    remote_publish_count: AtomicU64,
    local_publish_count: AtomicU64,
}

impl MeshBridge {
    /// Offline bridge: local event log, no sagas.
    pub fn offline() -> Self {
        Self {
            events: None,
            sagas: None,
            breaker: CircuitBreaker::new(),
            local_events: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            remote_publish_count: AtomicU64::new(0),
            local_publish_count: AtomicU64::new(0),
        }
    }

    pub fn connected(events: Arc<EventStore>, sagas: Arc<SagaOrchestrator>) -> Self {
        Self {
            events: Some(events),
            sagas: Some(sagas),
            breaker: CircuitBreaker::new(),
            local_events: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            remote_publish_count: AtomicU64::new(0),
            local_publish_count: AtomicU64::new(0),
        }
    }

    // ==================== Event publishing ====================

    pub async fn publish_event(
        &self,
        event_type: EventType,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> PublishResult {
        debug!(event_type = event_type.as_str(), "Publishing event");

        if let Some(events) = &self.events {
            let result = events
                .append(EventCreate {
                    event_type: event_type.as_str().to_string(),
                    aggregate_type: "plan".to_string(),
                    aggregate_id: payload
                        .get("plan_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    payload: payload.clone(),
                    metadata: match correlation_id {
                        Some(id) => json!({"correlation_id": id}),
                        None => json!({}),
                    },
                })
                .await;

            match result {
                Ok(event) => {
                    self.remote_publish_count.fetch_add(1, Ordering::Relaxed);
                    return PublishResult {
                        success: true,
                        event_id: event.event_id.to_string(),
                        remote: true,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!("Remote publish failed, falling back to local: {}", e);
                }
            }
        }

        let event = LocalEvent {
            event_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            event_type,
            payload,
            correlation_id: correlation_id.map(String::from),
            timestamp: Utc::now(),
        };
        let event_id = event.event_id.clone();
        self.local_events.lock().push(event);
        self.local_publish_count.fetch_add(1, Ordering::Relaxed);

        PublishResult {
            success: true,
            event_id,
            remote: false,
            error: None,
        }
    }

    pub async fn publish_plan_started(
        &self,
        plan_id: &str,
        unit_count: usize,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::PlanStarted,
            json!({"plan_id": plan_id, "unit_count": unit_count}),
            Some(correlation_id),
        )
        .await
    }

    pub async fn publish_plan_completed(
        &self,
        plan_id: &str,
        passed_count: usize,
        failed_count: usize,
        score: f64,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::PlanCompleted,
            json!({
                "plan_id": plan_id,
                "passed_count": passed_count,
                "failed_count": failed_count,
                "score": score,
            }),
            Some(correlation_id),
        )
        .await
    }

    pub async fn publish_plan_failed(
        &self,
        plan_id: &str,
        error: &str,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::PlanFailed,
            json!({"plan_id": plan_id, "error": error}),
            Some(correlation_id),
        )
        .await
    }

    pub async fn publish_unit_started(
        &self,
        unit_id: &str,
        plan_id: &str,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::UnitStarted,
            json!({"unit_id": unit_id, "plan_id": plan_id}),
            Some(correlation_id),
        )
        .await
    }

    pub async fn publish_unit_completed(
        &self,
        unit_id: &str,
        plan_id: &str,
        score: f64,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::UnitCompleted,
            json!({"unit_id": unit_id, "plan_id": plan_id, "score": score}),
            Some(correlation_id),
        )
        .await
    }

    pub async fn publish_unit_failed(
        &self,
        unit_id: &str,
        plan_id: &str,
        error: &str,
        correlation_id: &str,
    ) -> PublishResult {
        self.publish_event(
            EventType::UnitFailed,
            json!({"unit_id": unit_id, "plan_id": plan_id, "error": error}),
            Some(correlation_id),
        )
        .await
    }

    // ==================== Sagas ====================

    pub async fn create_saga(
        &self,
        name: &str,
        steps: Vec<SagaStepDef>,
        correlation_id: Option<String>,
    ) -> Result<Saga, crate::PipelineError> {
        match &self.sagas {
            Some(sagas) => Ok(sagas.create_saga(name, steps, correlation_id).await),
            None => Err(crate::PipelineError::Bridge(
                "saga orchestrator not connected".to_string(),
            )),
        }
    }

    pub async fn execute_saga(&self, saga_id: &str) -> Result<Saga, crate::PipelineError> {
        match &self.sagas {
            Some(sagas) => Ok(sagas.execute_saga(saga_id).await?),
            None => Err(crate::PipelineError::Bridge(
                "saga orchestrator not connected".to_string(),
            )),
        }
    }

    // ==================== Circuit breakers ====================

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // ==================== Local event queries ====================

    pub fn get_events(
        &self,
        event_type: Option<EventType>,
        correlation_id: Option<&str>,
        limit: usize,
    ) -> Vec<LocalEvent> {
        let events = self.local_events.lock();
        let filtered: Vec<LocalEvent> = events
            .iter()
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .filter(|e| {
                correlation_id
                    .map(|c| e.correlation_id.as_deref() == Some(c))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn clear(&self) {
        self.local_events.lock().clear();
    }
}

#[async_trait]
impl Bridge for MeshBridge {
    async fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(connected = self.events.is_some(), "MeshBridge initialized");
        }
    }

    async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.events.is_some()
    }

    fn get_statistics(&self) -> Value {
        json!({
            "connected": self.events.is_some(),
            "initialized": self.initialized.load(Ordering::SeqCst),
            "remote_publish_count": self.remote_publish_count.load(Ordering::Relaxed),
            "local_publish_count": self.local_publish_count.load(Ordering::Relaxed),
            "local_events": self.local_events.lock().len(),
            "circuit_breakers": self.breaker.snapshot_all().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_publish_lands_in_local_log() {
        let bridge = MeshBridge::offline();
        bridge.initialize().await;

        let result = bridge
            .publish_plan_started("plan-1", 3, "exec-1")
            .await;
        assert!(result.success);
        assert!(!result.remote);

        let events = bridge.get_events(Some(EventType::PlanStarted), None, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["unit_count"], json!(3));
    }

    #[tokio::test]
    async fn test_events_filter_by_correlation_id() {
        let bridge = MeshBridge::offline();
        bridge.publish_unit_started("u1", "p1", "exec-1").await;
        bridge.publish_unit_started("u2", "p1", "exec-2").await;

        let events = bridge.get_events(None, Some("exec-2"), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["unit_id"], json!("u2"));
    }

    #[tokio::test]
    async fn test_connected_publish_reaches_event_log() {
        use workflow_store::{EventQuery, LocalEventBus};

        let events = Arc::new(
            EventStore::connect("sqlite::memory:", Arc::new(LocalEventBus::new()))
                .await
                .unwrap(),
        );
        let sagas = SagaOrchestrator::new(Arc::new(NoopExecutor));
        let bridge = MeshBridge::connected(events.clone(), sagas);

        let result = bridge.publish_plan_started("plan-1", 2, "exec-1").await;
        assert!(result.remote);

        let stored = events
            .query(EventQuery::for_aggregate("plan", "plan-1"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, "plan.started");
    }

    #[tokio::test]
    async fn test_saga_calls_require_connection() {
        let bridge = MeshBridge::offline();
        let err = bridge.create_saga("s", vec![], None).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    struct NoopExecutor;

    #[async_trait]
    impl service_mesh::StepExecutor for NoopExecutor {
        async fn execute(
            &self,
            _action: &service_mesh::SagaAction,
        ) -> Result<Value, service_mesh::IntegrationError> {
            Ok(Value::Null)
        }
    }
}
