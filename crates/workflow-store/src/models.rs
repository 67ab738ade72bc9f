//! Typed aggregates persisted by the workflow store.
//!
//! JSON-bearing columns stay `serde_json::Value` at this boundary; every
//! enum serializes as its lowercase variant name to stay compatible with
//! the persisted rows and the wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Compensating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    None,
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Event,
    Schedule,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
    Public,
}

// Wire names must stay in lockstep with the serde representation above.
impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}
impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
        }
    }
}
impl NodeExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }
}
impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}
impl CompensationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}
impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
        }
    }
}
impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Public => "public",
        }
    }
}

pub(crate) fn parse_enum<T: serde::de::DeserializeOwned>(
    s: &str,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::String(s.to_string()))
}

// ============================================================================
// Workflow Definitions
// ============================================================================

/// Structured body of a workflow definition. Nodes and edges stay open JSON:
/// their shape is owned by the paradigm that interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionBody {
    pub paradigm: String,
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub edges: Vec<Value>,
    #[serde(default)]
    pub entry_node_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub uuid: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub definition: WorkflowDefinitionBody,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub status: WorkflowStatus,
    pub visibility: Visibility,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: String,
    pub definition: WorkflowDefinitionBody,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinitionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub definition: Option<WorkflowDefinitionBody>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<WorkflowStatus>,
    pub visibility: Option<Visibility>,
    pub metadata: Option<Value>,
}

// ============================================================================
// Workflow Executions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub input_parameters: Value,
    pub output_result: Option<Value>,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub execution_state: Value,
    pub checkpoint_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_required: bool,
    pub compensation_status: CompensationStatus,
    pub compensated_nodes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionCreate {
    pub workflow_id: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default)]
    pub trace_id: Option<String>,
}

// ============================================================================
// Node Executions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNodeExecution {
    pub node_execution_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub compensation_action: Option<String>,
    pub compensated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionCreate {
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default)]
    pub compensation_action: Option<String>,
}

fn default_max_retries() -> i64 {
    3
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub trigger_id: String,
    pub workflow_id: String,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTriggerCreate {
    pub workflow_id: String,
    pub trigger_type: TriggerType,
    #[serde(default = "empty_object")]
    pub trigger_config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Approval Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub execution_id: String,
    pub node_id: Option<String>,
    pub request_type: String,
    pub request_message: String,
    pub request_data: Value,
    pub status: ApprovalStatus,
    pub responded_by: Option<String>,
    pub response_data: Value,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestCreate {
    pub execution_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub request_type: String,
    pub request_message: String,
    #[serde(default = "empty_object")]
    pub request_data: Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub responded_by: String,
    #[serde(default = "empty_object")]
    pub response_data: Value,
}

// ============================================================================
// Events
// ============================================================================

/// Append-only change notification for an aggregate transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    /// Dotted type, e.g. `workflow.execution.updated`.
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub metadata: Value,
    /// Monotonic per-aggregate counter, starting at 1.
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreate {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

// ============================================================================
// Response envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Full execution view: the row plus its node attempts and open approvals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionDetail {
    pub execution: WorkflowExecution,
    pub node_executions: Vec<WorkflowNodeExecution>,
    pub pending_approvals: Vec<ApprovalRequest>,
}
