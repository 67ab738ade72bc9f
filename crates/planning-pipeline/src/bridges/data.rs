//! Data bridge: persists planning artifacts through the store's event log,
//! falling back to in-memory records when the store is unreachable.

use crate::bridges::Bridge;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workflow_store::{EventCreate, EventStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreResultType {
    Plan,
    Unit,
    Validation,
    Execution,
}

impl StoreResultType {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Plan => "plan.stored",
            Self::Unit => "plan.unit.stored",
            Self::Validation => "plan.validation.stored",
            Self::Execution => "plan.execution.stored",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResult {
    pub success: bool,
    pub record_id: String,
    pub result_type: StoreResultType,
    /// Whether the record reached the remote store or only local fallback.
    pub remote: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record_type: StoreResultType,
    data: Value,
    created_at: DateTime<Utc>,
}

pub struct DataBridge {
    events: Option<Arc<EventStore>>,
    local: Mutex<HashMap<String, StoredRecord>>,
    initialized: AtomicBool,
    remote_count: AtomicU64,
    local_count: AtomicU64,
}

impl DataBridge {
    /// Offline bridge: every record lands in the local fallback.
    pub fn offline() -> Self {
        Self {
            events: None,
            local: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            remote_count: AtomicU64::new(0),
            local_count: AtomicU64::new(0),
        }
    }

    pub fn connected(events: Arc<EventStore>) -> Self {
        Self {
            events: Some(events),
            local: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            remote_count: AtomicU64::new(0),
            local_count: AtomicU64::new(0),
        }
    }

    async fn store(
        &self,
        result_type: StoreResultType,
        record_id: &str,
        data: Value,
    ) -> StoreResult {
        if let Some(events) = &self.events {
            let result = events
                .append(EventCreate {
                    event_type: result_type.event_type().to_string(),
                    aggregate_type: "plan".to_string(),
                    aggregate_id: record_id.to_string(),
                    payload: data.clone(),
                    metadata: json!({}),
                })
                .await;

            match result {
                Ok(_) => {
                    self.remote_count.fetch_add(1, Ordering::Relaxed);
                    debug!(record_id, ?result_type, "Stored record remotely");
                    return StoreResult {
                        success: true,
                        record_id: record_id.to_string(),
                        result_type,
                        remote: true,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(record_id, "Remote store failed, using local fallback: {}", e);
                }
            }
        }

        self.local.lock().insert(
            record_id.to_string(),
            StoredRecord {
                record_type: result_type,
                data,
                created_at: Utc::now(),
            },
        );
        self.local_count.fetch_add(1, Ordering::Relaxed);
        StoreResult {
            success: true,
            record_id: record_id.to_string(),
            result_type,
            remote: false,
            error: None,
        }
    }

    pub async fn store_plan(&self, plan_id: &str, data: Value) -> StoreResult {
        self.store(StoreResultType::Plan, plan_id, data).await
    }

    pub async fn store_unit(&self, unit_id: &str, plan_id: &str, mut data: Value) -> StoreResult {
        if let Value::Object(map) = &mut data {
            map.insert("plan_id".to_string(), json!(plan_id));
        }
        let record_id = format!("{}:{}", plan_id, unit_id);
        self.store(StoreResultType::Unit, &record_id, data).await
    }

    pub async fn store_validation(&self, unit_id: &str, data: Value) -> StoreResult {
        let record_id = format!("{}:validation:{}", unit_id, &Uuid::new_v4().simple().to_string()[..8]);
        self.store(StoreResultType::Validation, &record_id, data).await
    }

    pub async fn store_execution(&self, execution_id: &str, data: Value) -> StoreResult {
        self.store(StoreResultType::Execution, execution_id, data).await
    }

    /// Local-fallback record lookup, used by offline pipelines and tests.
    pub fn get_local_record(&self, record_id: &str) -> Option<Value> {
        self.local.lock().get(record_id).map(|r| r.data.clone())
    }

    pub fn local_records_of(&self, result_type: StoreResultType) -> Vec<Value> {
        let local = self.local.lock();
        let mut records: Vec<(&String, &StoredRecord)> = local
            .iter()
            .filter(|(_, r)| r.record_type == result_type)
            .collect();
        records.sort_by_key(|(_, r)| r.created_at);
        records.into_iter().map(|(_, r)| r.data.clone()).collect()
    }
}

#[async_trait]
impl Bridge for DataBridge {
    async fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(connected = self.events.is_some(), "DataBridge initialized");
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
            "remote_count": self.remote_count.load(Ordering::Relaxed),
            "local_count": self.local_count.load(Ordering::Relaxed),
            "local_records": self.local.lock().len(),
        })
    }
}
