//! Saga orchestration with compensation.
//!
//! A saga is an ordered step list where every step carries a compensating
//! action. Steps run sequentially; the first failure flips the saga into
//! compensation, which runs the completed steps' compensations in reverse.
//! Compensation is best-effort: a failing compensation is logged and the
//! sweep continues.
//!
//! Saga progress is recorded as `aggregate_type = "saga"` events on the
//! store's event log, reusing the planning event vocabulary.

use crate::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use workflow_store::{EventCreate, EventStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Compensating,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Typed saga action. Execution goes through an injected [`StepExecutor`];
/// an action with no matching executor fails the step rather than silently
/// succeeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaAction {
    /// Route a request through the mesh.
    HttpRequest {
        service: String,
        method: String,
        path: String,
        #[serde(default)]
        body: Value,
    },
    /// Run a named handler registered with the executor.
    Handler {
        name: String,
        #[serde(default)]
        params: Value,
    },
    /// Explicit no-op, for steps whose compensation has nothing to undo.
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub step_id: String,
    pub name: String,
    pub action: SagaAction,
    pub compensation: SagaAction,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Step definition handed to [`SagaOrchestrator::create_saga`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStepDef {
    pub name: String,
    pub action: SagaAction,
    pub compensation: SagaAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: String,
    pub name: String,
    pub steps: Vec<SagaStep>,
    pub status: SagaStatus,
    pub current_step: usize,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Port executing a single saga action.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, action: &SagaAction) -> Result<Value, IntegrationError>;
}

/// Executor that routes `HttpRequest` actions through the request
/// orchestrator and rejects everything else.
pub struct MeshStepExecutor {
    orchestrator: Arc<crate::orchestrator::RequestOrchestrator>,
}

impl MeshStepExecutor {
    pub fn new(orchestrator: Arc<crate::orchestrator::RequestOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl StepExecutor for MeshStepExecutor {
    async fn execute(&self, action: &SagaAction) -> Result<Value, IntegrationError> {
        match action {
            SagaAction::HttpRequest {
                service,
                method,
                path,
                body,
            } => {
                let method = method
                    .parse::<reqwest::Method>()
                    .map_err(|_| IntegrationError::Saga(format!("invalid method: {}", method)))?;
                let data = if body.is_null() { None } else { Some(body.clone()) };
                self.orchestrator
                    .route_request(service, method, path, data, None, None)
                    .await
            }
            SagaAction::Noop => Ok(Value::Null),
            SagaAction::Handler { name, .. } => Err(IntegrationError::Saga(format!(
                "no executor registered for handler: {}",
                name
            ))),
        }
    }
}

pub struct SagaOrchestrator {
    sagas: DashMap<String, Saga>,
    executor: Arc<dyn StepExecutor>,
    events: Option<Arc<EventStore>>,
    executed_count: std::sync::atomic::AtomicU64,
    compensated_count: std::sync::atomic::AtomicU64,
}

impl SagaOrchestrator {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Arc<Self> {
        Arc::new(Self {
            sagas: DashMap::new(),
            executor,
            events: None,
            executed_count: Default::default(),
            compensated_count: Default::default(),
        })
    }

    pub fn with_event_store(executor: Arc<dyn StepExecutor>, events: Arc<EventStore>) -> Arc<Self> {
        Arc::new(Self {
            sagas: DashMap::new(),
            executor,
            events: Some(events),
            executed_count: Default::default(),
            compensated_count: Default::default(),
        })
    }

    /// Persist a saga with every step pending.
    pub async fn create_saga(
        &self,
        name: &str,
        steps: Vec<SagaStepDef>,
        correlation_id: Option<String>,
    ) -> Saga {
        let saga_id = Uuid::new_v4().simple().to_string()[..12].to_string();

        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, def)| SagaStep {
                step_id: format!("{}-{}", saga_id, i),
                name: def.name,
                action: def.action,
                compensation: def.compensation,
                status: StepStatus::Pending,
                result: None,
                error: None,
            })
            .collect::<Vec<_>>();

        let saga = Saga {
            saga_id: saga_id.clone(),
            name: name.to_string(),
            steps,
            status: SagaStatus::Pending,
            current_step: 0,
            correlation_id,
            created_at: Utc::now(),
            completed_at: None,
        };

        info!(saga_id = %saga_id, name, steps = saga.steps.len(), "Created saga");
        self.record(&saga, "saga.created", json!({"name": saga.name})).await;
        self.sagas.insert(saga_id, saga.clone());
        saga
    }

    pub fn get_saga(&self, saga_id: &str) -> Option<Saga> {
        self.sagas.get(saga_id).map(|s| s.clone())
    }

    /// Run all steps in order; compensate completed steps in reverse on the
    /// first failure. Terminal status is `completed` or `failed`.
    pub async fn execute_saga(&self, saga_id: &str) -> Result<Saga, IntegrationError> {
        let mut saga = self
            .sagas
            .get(saga_id)
            .map(|s| s.clone())
            .ok_or_else(|| IntegrationError::Saga(format!("saga not found: {}", saga_id)))?;

        saga.status = SagaStatus::Running;
        self.sagas.insert(saga_id.to_string(), saga.clone());
        info!(saga_id, name = %saga.name, "Executing saga");

        self.record(&saga, "plan.started", json!({"saga_id": saga_id, "name": saga.name}))
            .await;

        let mut failure: Option<(usize, String)> = None;

        for i in 0..saga.steps.len() {
            saga.current_step = i;
            saga.steps[i].status = StepStatus::Running;
            self.sagas.insert(saga_id.to_string(), saga.clone());

            match self.executor.execute(&saga.steps[i].action).await {
                Ok(result) => {
                    saga.steps[i].status = StepStatus::Completed;
                    saga.steps[i].result = Some(result);
                    self.executed_count
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    error!(saga_id, step = %saga.steps[i].name, "Saga step failed: {}", e);
                    saga.steps[i].status = StepStatus::Failed;
                    saga.steps[i].error = Some(e.to_string());
                    failure = Some((i, e.to_string()));
                    break;
                }
            }
        }

        match failure {
            None => {
                saga.status = SagaStatus::Completed;
                saga.completed_at = Some(Utc::now());
                self.record(
                    &saga,
                    "plan.completed",
                    json!({"saga_id": saga_id, "steps_completed": saga.steps.len()}),
                )
                .await;
            }
            Some((failed_at, error)) => {
                saga.status = SagaStatus::Compensating;
                self.sagas.insert(saga_id.to_string(), saga.clone());
                self.compensate(&mut saga, failed_at).await;

                saga.status = SagaStatus::Failed;
                saga.completed_at = Some(Utc::now());
                self.record(
                    &saga,
                    "plan.failed",
                    json!({"saga_id": saga_id, "error": error, "failed_step": failed_at}),
                )
                .await;
            }
        }

        self.sagas.insert(saga_id.to_string(), saga.clone());
        Ok(saga)
    }

    /// Run compensations for steps `failed_at-1 .. 0`, in reverse. A failed
    /// compensation never halts the sweep.
    async fn compensate(&self, saga: &mut Saga, failed_at: usize) {
        info!(saga_id = %saga.saga_id, "Compensating saga");

        for i in (0..failed_at).rev() {
            if saga.steps[i].status != StepStatus::Completed {
                continue;
            }
            saga.steps[i].status = StepStatus::Compensating;

            match self.executor.execute(&saga.steps[i].compensation).await {
                Ok(_) => {
                    saga.steps[i].status = StepStatus::Compensated;
                    self.compensated_count
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        saga_id = %saga.saga_id,
                        step = %saga.steps[i].name,
                        "Compensation failed, continuing sweep: {}", e
                    );
                    saga.steps[i].status = StepStatus::Compensated;
                    saga.steps[i].error = Some(format!("compensation failed: {}", e));
                }
            }
        }
    }

    async fn record(&self, saga: &Saga, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            let result = events
                .append(EventCreate {
                    event_type: event_type.to_string(),
                    aggregate_type: "saga".to_string(),
                    aggregate_id: saga.saga_id.clone(),
                    payload,
                    metadata: match &saga.correlation_id {
                        Some(id) => json!({"correlation_id": id}),
                        None => json!({}),
                    },
                })
                .await;
            if let Err(e) = result {
                warn!(saga_id = %saga.saga_id, "Saga event not recorded: {}", e);
            }
        }
    }

    pub fn get_statistics(&self) -> Value {
        json!({
            "total_sagas": self.sagas.len(),
            "steps_executed": self.executed_count.load(std::sync::atomic::Ordering::Relaxed),
            "steps_compensated": self.compensated_count.load(std::sync::atomic::Ordering::Relaxed),
        })
    }
}
