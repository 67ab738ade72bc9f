//! Persistent storage for the workflow orchestration system.
//!
//! Manages workflow definitions, executions, node executions, triggers and
//! approval requests over a relational store. Every successful mutation
//! appends a change event to the event log, which publishes on the bus
//! best-effort. State-changing operations on one aggregate row are
//! serialized by the store's single writer connection.

use crate::bus::EventBus;
use crate::event_store::EventStore;
use crate::models::*;
use crate::{tag_id, StoreError};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct WorkflowStore {
    pool: SqlitePool,
    events: EventStore,
}

impl WorkflowStore {
    /// Open (creating if missing) the store at `url` and initialize the
    /// schema. A single writer connection serializes row mutations.
    pub async fn connect(url: &str, bus: Arc<dyn EventBus>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::new(pool, bus);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool, bus: Arc<dyn EventBus>) -> Self {
        let events = EventStore::new(pool.clone(), bus);
        Self { pool, events }
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.events.init_schema().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                workflow_id   TEXT PRIMARY KEY,
                uuid          TEXT NOT NULL,
                name          TEXT NOT NULL,
                description   TEXT,
                version       TEXT NOT NULL,
                definition    TEXT NOT NULL,
                category      TEXT,
                tags          TEXT NOT NULL,
                status        TEXT NOT NULL,
                visibility    TEXT NOT NULL,
                metadata      TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                execution_id          TEXT PRIMARY KEY,
                workflow_id           TEXT NOT NULL,
                workflow_version      TEXT NOT NULL,
                input_parameters      TEXT NOT NULL,
                output_result         TEXT,
                status                TEXT NOT NULL,
                current_node_id       TEXT,
                execution_state       TEXT NOT NULL,
                checkpoint_id         TEXT,
                error_code            TEXT,
                error_message         TEXT,
                compensation_required INTEGER NOT NULL DEFAULT 0,
                compensation_status   TEXT NOT NULL,
                compensated_nodes     TEXT NOT NULL,
                started_at            TEXT,
                completed_at          TEXT,
                duration_ms           INTEGER,
                trace_id              TEXT NOT NULL,
                created_at            TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_node_executions (
                node_execution_id   TEXT PRIMARY KEY,
                execution_id        TEXT NOT NULL,
                node_id             TEXT NOT NULL,
                node_type           TEXT NOT NULL,
                status              TEXT NOT NULL,
                input_data          TEXT NOT NULL,
                output_data         TEXT,
                error_code          TEXT,
                error_message       TEXT,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                max_retries         INTEGER NOT NULL DEFAULT 3,
                compensation_action TEXT,
                compensated         INTEGER NOT NULL DEFAULT 0,
                started_at          TEXT,
                completed_at        TEXT,
                duration_ms         INTEGER,
                created_at          TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_triggers (
                trigger_id        TEXT PRIMARY KEY,
                workflow_id       TEXT NOT NULL,
                trigger_type      TEXT NOT NULL,
                trigger_config    TEXT NOT NULL,
                enabled           INTEGER NOT NULL DEFAULT 1,
                last_triggered_at TEXT,
                trigger_count     INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_approval_requests (
                approval_id     TEXT PRIMARY KEY,
                execution_id    TEXT NOT NULL,
                node_id         TEXT,
                request_type    TEXT NOT NULL,
                request_message TEXT NOT NULL,
                request_data    TEXT NOT NULL,
                status          TEXT NOT NULL,
                responded_by    TEXT,
                response_data   TEXT NOT NULL,
                responded_at    TEXT,
                expires_at      TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a change event; failure is logged, never propagated.
    async fn emit(&self, event_type: &str, aggregate_id: &str, payload: Value) {
        let result = self
            .events
            .append(EventCreate {
                event_type: event_type.to_string(),
                aggregate_type: "workflow".to_string(),
                aggregate_id: aggregate_id.to_string(),
                payload,
                metadata: empty_object(),
            })
            .await;
        if let Err(e) = result {
            warn!(event_type, aggregate_id, "Change event not recorded: {}", e);
        }
    }

    // ========================================================================
    // Workflow definitions
    // ========================================================================

    pub async fn create_workflow(
        &self,
        data: WorkflowDefinitionCreate,
    ) -> Result<WorkflowDefinition, StoreError> {
        let workflow = WorkflowDefinition {
            workflow_id: tag_id("wf", 12),
            uuid: Uuid::new_v4(),
            name: data.name,
            description: data.description,
            version: data.version,
            definition: data.definition,
            category: data.category,
            tags: data.tags,
            status: WorkflowStatus::Draft,
            visibility: data.visibility,
            metadata: data.metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO workflow_definitions
             (workflow_id, uuid, name, description, version, definition, category,
              tags, status, visibility, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.workflow_id)
        .bind(workflow.uuid.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.version)
        .bind(serde_json::to_string(&workflow.definition)?)
        .bind(&workflow.category)
        .bind(serde_json::to_string(&workflow.tags)?)
        .bind(workflow.status.as_str())
        .bind(workflow.visibility.as_str())
        .bind(serde_json::to_string(&workflow.metadata)?)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.created",
            &workflow.workflow_id,
            json!({"name": workflow.name, "version": workflow.version}),
        )
        .await;

        info!(workflow_id = %workflow.workflow_id, "Created workflow definition");
        Ok(workflow)
    }

    pub async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_workflow(&r)).transpose()
    }

    pub async fn get_workflow_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_workflow(&r)).transpose()
    }

    pub async fn update_workflow(
        &self,
        workflow_id: &str,
        data: WorkflowDefinitionUpdate,
    ) -> Result<WorkflowDefinition, StoreError> {
        let mut workflow = self
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;

        if let Some(name) = data.name {
            workflow.name = name;
        }
        if let Some(description) = data.description {
            workflow.description = Some(description);
        }
        if let Some(version) = data.version {
            workflow.version = version;
        }
        if let Some(definition) = data.definition {
            workflow.definition = definition;
        }
        if let Some(category) = data.category {
            workflow.category = Some(category);
        }
        if let Some(tags) = data.tags {
            workflow.tags = tags;
        }
        if let Some(status) = data.status {
            workflow.status = status;
        }
        if let Some(visibility) = data.visibility {
            workflow.visibility = visibility;
        }
        if let Some(metadata) = data.metadata {
            workflow.metadata = metadata;
        }
        workflow.updated_at = Utc::now();

        sqlx::query(
            "UPDATE workflow_definitions
             SET name = ?, description = ?, version = ?, definition = ?, category = ?,
                 tags = ?, status = ?, visibility = ?, metadata = ?, updated_at = ?
             WHERE workflow_id = ?",
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.version)
        .bind(serde_json::to_string(&workflow.definition)?)
        .bind(&workflow.category)
        .bind(serde_json::to_string(&workflow.tags)?)
        .bind(workflow.status.as_str())
        .bind(workflow.visibility.as_str())
        .bind(serde_json::to_string(&workflow.metadata)?)
        .bind(workflow.updated_at)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.updated",
            workflow_id,
            json!({"status": workflow.status.as_str()}),
        )
        .await;

        Ok(workflow)
    }

    /// Soft delete: the row stays, the workflow drops out of listings.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_definitions SET status = ?, updated_at = ? WHERE workflow_id = ?",
        )
        .bind(WorkflowStatus::Archived.as_str())
        .bind(Utc::now())
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        let archived = result.rows_affected() == 1;
        if archived {
            self.emit("workflow.archived", workflow_id, empty_object()).await;
        }
        Ok(archived)
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        category: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<ListPage<WorkflowDefinition>, StoreError> {
        // Archived workflows drop out of listings unless asked for by
        // status explicitly.
        let mut conditions = vec![if status.is_some() {
            "status = ?".to_string()
        } else {
            "status != 'archived'".to_string()
        }];
        if category.is_some() {
            conditions.push("category = ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!(
            "SELECT COUNT(*) FROM workflow_definitions WHERE {}",
            where_clause
        );
        let list_sql = format!(
            "SELECT * FROM workflow_definitions WHERE {}
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql);
        let mut list_q = sqlx::query(&list_sql);
        if let Some(s) = status {
            count_q = count_q.bind(s.as_str());
            list_q = list_q.bind(s.as_str());
        }
        if let Some(c) = category {
            count_q = count_q.bind(c);
            list_q = list_q.bind(c);
        }

        let total = count_q.fetch_one(&self.pool).await?;
        let rows = list_q.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_workflow)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListPage {
            items,
            total,
            limit,
            offset,
        })
    }

    // ========================================================================
    // Workflow executions
    // ========================================================================

    pub async fn create_execution(
        &self,
        data: WorkflowExecutionCreate,
    ) -> Result<WorkflowExecution, StoreError> {
        let workflow = self
            .get_workflow(&data.workflow_id)
            .await?
            .ok_or_else(|| StoreError::not_found("workflow", data.workflow_id.clone()))?;

        let execution = WorkflowExecution {
            execution_id: tag_id("exec", 12),
            workflow_id: data.workflow_id,
            workflow_version: workflow.version,
            input_parameters: data.parameters,
            output_result: None,
            status: ExecutionStatus::Pending,
            current_node_id: None,
            execution_state: empty_object(),
            checkpoint_id: None,
            error_code: None,
            error_message: None,
            compensation_required: false,
            compensation_status: CompensationStatus::None,
            compensated_nodes: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            trace_id: data.trace_id.unwrap_or_else(|| tag_id("trace", 8)),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO workflow_executions
             (execution_id, workflow_id, workflow_version, input_parameters, output_result,
              status, current_node_id, execution_state, checkpoint_id, error_code,
              error_message, compensation_required, compensation_status, compensated_nodes,
              started_at, completed_at, duration_ms, trace_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.execution_id)
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_version)
        .bind(serde_json::to_string(&execution.input_parameters)?)
        .bind(Option::<String>::None)
        .bind(execution.status.as_str())
        .bind(&execution.current_node_id)
        .bind(serde_json::to_string(&execution.execution_state)?)
        .bind(&execution.checkpoint_id)
        .bind(&execution.error_code)
        .bind(&execution.error_message)
        .bind(execution.compensation_required)
        .bind(execution.compensation_status.as_str())
        .bind(serde_json::to_string(&execution.compensated_nodes)?)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(&execution.trace_id)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.execution.created",
            &execution.execution_id,
            json!({"workflow_id": execution.workflow_id, "trace_id": execution.trace_id}),
        )
        .await;

        Ok(execution)
    }

    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_execution(&r)).transpose()
    }

    async fn require_execution(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        self.get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("execution", execution_id))
    }

    /// Mark an execution running. `started_at` is stamped only on the first
    /// transition into `running`.
    pub async fn start_execution(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        self.require_execution(execution_id).await?;

        sqlx::query(
            "UPDATE workflow_executions
             SET status = ?, started_at = COALESCE(started_at, ?)
             WHERE execution_id = ?",
        )
        .bind(ExecutionStatus::Running.as_str())
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.execution.started",
            execution_id,
            json!({"status": "running"}),
        )
        .await;

        self.require_execution(execution_id).await
    }

    pub async fn complete_execution(
        &self,
        execution_id: &str,
        output: Value,
    ) -> Result<WorkflowExecution, StoreError> {
        self.finish_execution(
            execution_id,
            ExecutionStatus::Completed,
            Some(output),
            None,
            None,
        )
        .await
    }

    pub async fn fail_execution(
        &self,
        execution_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        self.finish_execution(
            execution_id,
            ExecutionStatus::Failed,
            None,
            Some(error_code.to_string()),
            Some(error_message.to_string()),
        )
        .await
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<Value>,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<WorkflowExecution, StoreError> {
        let execution = self.require_execution(execution_id).await?;
        let completed_at = Utc::now();
        let duration_ms = execution
            .started_at
            .map(|s| (completed_at - s).num_milliseconds());

        sqlx::query(
            "UPDATE workflow_executions
             SET status = ?, output_result = ?, error_code = ?, error_message = ?,
                 completed_at = ?, duration_ms = ?
             WHERE execution_id = ?",
        )
        .bind(status.as_str())
        .bind(match &output {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        })
        .bind(&error_code)
        .bind(&error_message)
        .bind(completed_at)
        .bind(duration_ms)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        let event_type = match status {
            ExecutionStatus::Completed => "workflow.execution.completed",
            ExecutionStatus::Failed => "workflow.execution.failed",
            _ => "workflow.execution.updated",
        };
        self.emit(
            event_type,
            execution_id,
            json!({"status": status.as_str(), "duration_ms": duration_ms}),
        )
        .await;

        self.require_execution(execution_id).await
    }

    pub async fn set_current_node(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_executions SET current_node_id = ? WHERE execution_id = ?")
            .bind(node_id)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<ListPage<WorkflowExecution>, StoreError> {
        let mut conditions = vec!["1=1".to_string()];
        if workflow_id.is_some() {
            conditions.push("workflow_id = ?".to_string());
        }
        if status.is_some() {
            conditions.push("status = ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!(
            "SELECT COUNT(*) FROM workflow_executions WHERE {}",
            where_clause
        );
        let list_sql = format!(
            "SELECT * FROM workflow_executions WHERE {}
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql);
        let mut list_q = sqlx::query(&list_sql);
        if let Some(w) = workflow_id {
            count_q = count_q.bind(w);
            list_q = list_q.bind(w);
        }
        if let Some(s) = status {
            count_q = count_q.bind(s.as_str());
            list_q = list_q.bind(s.as_str());
        }

        let total = count_q.fetch_one(&self.pool).await?;
        let rows = list_q.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListPage {
            items,
            total,
            limit,
            offset,
        })
    }

    /// Execution plus its node attempts and open approvals.
    pub async fn get_execution_detail(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecutionDetail>, StoreError> {
        let Some(execution) = self.get_execution(execution_id).await? else {
            return Ok(None);
        };
        let node_executions = self.list_node_executions(execution_id).await?;
        let pending_approvals = self.list_pending_approvals(Some(execution_id)).await?;
        Ok(Some(WorkflowExecutionDetail {
            execution,
            node_executions,
            pending_approvals,
        }))
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Store `execution_state` and a fresh checkpoint id on the row
    /// atomically; returns the checkpoint id.
    pub async fn save_checkpoint(
        &self,
        execution_id: &str,
        state: Value,
    ) -> Result<String, StoreError> {
        self.require_execution(execution_id).await?;
        let checkpoint_id = tag_id("ckpt", 8);

        sqlx::query(
            "UPDATE workflow_executions SET checkpoint_id = ?, execution_state = ?
             WHERE execution_id = ?",
        )
        .bind(&checkpoint_id)
        .bind(serde_json::to_string(&state)?)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.execution.updated",
            execution_id,
            json!({"checkpoint_id": checkpoint_id}),
        )
        .await;

        info!(execution_id, checkpoint_id = %checkpoint_id, "Saved checkpoint");
        Ok(checkpoint_id)
    }

    pub async fn restore_checkpoint(
        &self,
        execution_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT execution_state FROM workflow_executions
             WHERE execution_id = ? AND checkpoint_id = ?",
        )
        .bind(execution_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let state: String = r.try_get("execution_state")?;
                Ok(Some(serde_json::from_str(&state)?))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Node executions
    // ========================================================================

    pub async fn record_node_execution(
        &self,
        data: NodeExecutionCreate,
    ) -> Result<WorkflowNodeExecution, StoreError> {
        let node = WorkflowNodeExecution {
            node_execution_id: tag_id("node", 12),
            execution_id: data.execution_id,
            node_id: data.node_id,
            node_type: data.node_type,
            status: NodeExecutionStatus::Running,
            input_data: data.input_data,
            output_data: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            max_retries: data.max_retries,
            compensation_action: data.compensation_action,
            compensated: false,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO workflow_node_executions
             (node_execution_id, execution_id, node_id, node_type, status, input_data,
              output_data, error_code, error_message, retry_count, max_retries,
              compensation_action, compensated, started_at, completed_at, duration_ms,
              created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&node.node_execution_id)
        .bind(&node.execution_id)
        .bind(&node.node_id)
        .bind(&node.node_type)
        .bind(node.status.as_str())
        .bind(serde_json::to_string(&node.input_data)?)
        .bind(Option::<String>::None)
        .bind(&node.error_code)
        .bind(&node.error_message)
        .bind(node.retry_count)
        .bind(node.max_retries)
        .bind(&node.compensation_action)
        .bind(node.compensated)
        .bind(node.started_at)
        .bind(node.completed_at)
        .bind(node.duration_ms)
        .bind(node.created_at)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.node.started",
            &node.execution_id,
            json!({"node_id": node.node_id, "node_execution_id": node.node_execution_id}),
        )
        .await;

        Ok(node)
    }

    pub async fn complete_node_execution(
        &self,
        node_execution_id: &str,
        output: Value,
    ) -> Result<WorkflowNodeExecution, StoreError> {
        self.finish_node_execution(
            node_execution_id,
            NodeExecutionStatus::Completed,
            Some(output),
            None,
            None,
        )
        .await
    }

    pub async fn fail_node_execution(
        &self,
        node_execution_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<WorkflowNodeExecution, StoreError> {
        self.finish_node_execution(
            node_execution_id,
            NodeExecutionStatus::Failed,
            None,
            Some(error_code.to_string()),
            Some(error_message.to_string()),
        )
        .await
    }

    async fn finish_node_execution(
        &self,
        node_execution_id: &str,
        status: NodeExecutionStatus,
        output: Option<Value>,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<WorkflowNodeExecution, StoreError> {
        let node = self
            .get_node_execution(node_execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("node execution", node_execution_id))?;

        let completed_at = Utc::now();
        let duration_ms = node
            .started_at
            .map(|s| (completed_at - s).num_milliseconds());

        sqlx::query(
            "UPDATE workflow_node_executions
             SET status = ?, output_data = ?, error_code = ?, error_message = ?,
                 completed_at = ?, duration_ms = ?
             WHERE node_execution_id = ?",
        )
        .bind(status.as_str())
        .bind(match &output {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        })
        .bind(&error_code)
        .bind(&error_message)
        .bind(completed_at)
        .bind(duration_ms)
        .bind(node_execution_id)
        .execute(&self.pool)
        .await?;

        let event_type = match status {
            NodeExecutionStatus::Completed => "workflow.node.completed",
            NodeExecutionStatus::Failed => "workflow.node.failed",
            _ => "workflow.node.updated",
        };
        self.emit(
            event_type,
            &node.execution_id,
            json!({"node_id": node.node_id, "status": status.as_str()}),
        )
        .await;

        self.get_node_execution(node_execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("node execution", node_execution_id))
    }

    pub async fn get_node_execution(
        &self,
        node_execution_id: &str,
    ) -> Result<Option<WorkflowNodeExecution>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM workflow_node_executions WHERE node_execution_id = ?")
                .bind(node_execution_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| Self::row_to_node_execution(&r)).transpose()
    }

    pub async fn list_node_executions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowNodeExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_node_executions WHERE execution_id = ?
             ORDER BY created_at ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_node_execution).collect()
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    pub async fn create_trigger(
        &self,
        data: WorkflowTriggerCreate,
    ) -> Result<WorkflowTrigger, StoreError> {
        let trigger = WorkflowTrigger {
            trigger_id: tag_id("trig", 12),
            workflow_id: data.workflow_id,
            trigger_type: data.trigger_type,
            trigger_config: data.trigger_config,
            enabled: data.enabled,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO workflow_triggers
             (trigger_id, workflow_id, trigger_type, trigger_config, enabled,
              last_triggered_at, trigger_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trigger.trigger_id)
        .bind(&trigger.workflow_id)
        .bind(trigger.trigger_type.as_str())
        .bind(serde_json::to_string(&trigger.trigger_config)?)
        .bind(trigger.enabled)
        .bind(trigger.last_triggered_at)
        .bind(trigger.trigger_count)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.trigger.created",
            &trigger.trigger_id,
            json!({"workflow_id": trigger.workflow_id, "trigger_type": trigger.trigger_type.as_str()}),
        )
        .await;

        Ok(trigger)
    }

    pub async fn get_trigger(
        &self,
        trigger_id: &str,
    ) -> Result<Option<WorkflowTrigger>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_triggers WHERE trigger_id = ?")
            .bind(trigger_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_trigger(&r)).transpose()
    }

    pub async fn set_trigger_enabled(
        &self,
        trigger_id: &str,
        enabled: bool,
    ) -> Result<WorkflowTrigger, StoreError> {
        sqlx::query(
            "UPDATE workflow_triggers SET enabled = ?, updated_at = ? WHERE trigger_id = ?",
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(trigger_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.trigger.updated",
            trigger_id,
            json!({"enabled": enabled}),
        )
        .await;

        self.get_trigger(trigger_id)
            .await?
            .ok_or_else(|| StoreError::not_found("trigger", trigger_id))
    }

    /// Atomically bump the fire counter and stamp the fire time.
    pub async fn record_trigger_fired(&self, trigger_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_triggers
             SET last_triggered_at = ?, trigger_count = trigger_count + 1
             WHERE trigger_id = ?",
        )
        .bind(Utc::now())
        .bind(trigger_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("trigger", trigger_id));
        }

        self.emit("workflow.trigger.fired", trigger_id, empty_object())
            .await;
        Ok(())
    }

    pub async fn list_triggers(
        &self,
        workflow_id: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<Vec<WorkflowTrigger>, StoreError> {
        let mut conditions = vec!["1=1".to_string()];
        if workflow_id.is_some() {
            conditions.push("workflow_id = ?".to_string());
        }
        if enabled.is_some() {
            conditions.push("enabled = ?".to_string());
        }
        let sql = format!(
            "SELECT * FROM workflow_triggers WHERE {} ORDER BY created_at DESC",
            conditions.join(" AND ")
        );

        let mut q = sqlx::query(&sql);
        if let Some(w) = workflow_id {
            q = q.bind(w);
        }
        if let Some(e) = enabled {
            q = q.bind(e);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_trigger).collect()
    }

    pub async fn delete_trigger(&self, trigger_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_triggers WHERE trigger_id = ?")
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() == 1;
        if deleted {
            self.emit("workflow.trigger.deleted", trigger_id, empty_object())
                .await;
        }
        Ok(deleted)
    }

    // ========================================================================
    // Approval requests
    // ========================================================================

    /// Create a pending approval and transition the parent execution to
    /// `waiting_approval` in the same transaction.
    pub async fn create_approval_request(
        &self,
        data: ApprovalRequestCreate,
    ) -> Result<ApprovalRequest, StoreError> {
        self.require_execution(&data.execution_id).await?;

        let approval = ApprovalRequest {
            approval_id: tag_id("appr", 12),
            execution_id: data.execution_id,
            node_id: data.node_id,
            request_type: data.request_type,
            request_message: data.request_message,
            request_data: data.request_data,
            status: ApprovalStatus::Pending,
            responded_by: None,
            response_data: empty_object(),
            responded_at: None,
            expires_at: data.expires_at,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workflow_approval_requests
             (approval_id, execution_id, node_id, request_type, request_message,
              request_data, status, responded_by, response_data, responded_at,
              expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&approval.approval_id)
        .bind(&approval.execution_id)
        .bind(&approval.node_id)
        .bind(&approval.request_type)
        .bind(&approval.request_message)
        .bind(serde_json::to_string(&approval.request_data)?)
        .bind(approval.status.as_str())
        .bind(&approval.responded_by)
        .bind(serde_json::to_string(&approval.response_data)?)
        .bind(approval.responded_at)
        .bind(approval.expires_at)
        .bind(approval.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE workflow_executions SET status = ? WHERE execution_id = ?")
            .bind(ExecutionStatus::WaitingApproval.as_str())
            .bind(&approval.execution_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.emit(
            "workflow.approval.created",
            &approval.execution_id,
            json!({"approval_id": approval.approval_id}),
        )
        .await;

        Ok(approval)
    }

    pub async fn get_approval_request(
        &self,
        approval_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_approval_requests WHERE approval_id = ?")
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_approval(&r)).transpose()
    }

    /// Record a response. Approving a request resumes the parent execution
    /// in the same transaction; rejecting leaves the execution state to the
    /// caller. Only `pending` requests accept responses.
    pub async fn respond_to_approval(
        &self,
        approval_id: &str,
        response: ApprovalResponse,
    ) -> Result<ApprovalRequest, StoreError> {
        let approval = self
            .get_approval_request(approval_id)
            .await?
            .ok_or_else(|| StoreError::not_found("approval", approval_id))?;

        if approval.status != ApprovalStatus::Pending {
            return Err(StoreError::InvalidTransition(format!(
                "approval {} is {}, expected pending",
                approval_id,
                approval.status.as_str()
            )));
        }

        let status = if response.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE workflow_approval_requests
             SET status = ?, responded_by = ?, response_data = ?, responded_at = ?
             WHERE approval_id = ?",
        )
        .bind(status.as_str())
        .bind(&response.responded_by)
        .bind(serde_json::to_string(&response.response_data)?)
        .bind(Utc::now())
        .bind(approval_id)
        .execute(&mut *tx)
        .await?;

        if response.approved {
            sqlx::query("UPDATE workflow_executions SET status = ? WHERE execution_id = ?")
                .bind(ExecutionStatus::Running.as_str())
                .bind(&approval.execution_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.emit(
            "workflow.approval.responded",
            &approval.execution_id,
            json!({"approval_id": approval_id, "status": status.as_str()}),
        )
        .await;

        self.get_approval_request(approval_id)
            .await?
            .ok_or_else(|| StoreError::not_found("approval", approval_id))
    }

    pub async fn list_pending_approvals(
        &self,
        execution_id: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows = match execution_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM workflow_approval_requests
                     WHERE execution_id = ? AND status = 'pending'
                     ORDER BY created_at ASC",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_approval_requests
                     WHERE status = 'pending' ORDER BY created_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_approval).collect()
    }

    /// Transition pending requests past their deadline to `expired`.
    /// Returns the number of rows expired.
    pub async fn expire_old_approvals(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_approval_requests
             SET status = 'expired'
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(count, "Expired stale approval requests");
        }
        Ok(count)
    }

    // ========================================================================
    // Saga / compensation
    // ========================================================================

    pub async fn mark_for_compensation(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        self.require_execution(execution_id).await?;

        sqlx::query(
            "UPDATE workflow_executions
             SET compensation_required = 1, compensation_status = ?, status = ?
             WHERE execution_id = ?",
        )
        .bind(CompensationStatus::Pending.as_str())
        .bind(ExecutionStatus::Compensating.as_str())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.execution.updated",
            execution_id,
            json!({"status": "compensating"}),
        )
        .await;

        self.require_execution(execution_id).await
    }

    /// Append `node_id` to the execution's compensated list and mark the
    /// node attempt compensated, in one transaction.
    pub async fn record_compensated_node(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<(), StoreError> {
        let execution = self.require_execution(execution_id).await?;
        let mut compensated = execution.compensated_nodes;
        compensated.push(node_id.to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE workflow_executions SET compensated_nodes = ? WHERE execution_id = ?")
            .bind(serde_json::to_string(&compensated)?)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE workflow_node_executions
             SET compensated = 1, status = 'compensated'
             WHERE execution_id = ? AND node_id = ?",
        )
        .bind(execution_id)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.emit(
            "workflow.node.compensated",
            execution_id,
            json!({"node_id": node_id}),
        )
        .await;

        Ok(())
    }

    pub async fn complete_compensation(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, StoreError> {
        self.require_execution(execution_id).await?;

        sqlx::query(
            "UPDATE workflow_executions
             SET compensation_status = ?, completed_at = ?
             WHERE execution_id = ?",
        )
        .bind(CompensationStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        self.emit(
            "workflow.execution.updated",
            execution_id,
            json!({"compensation_status": "completed"}),
        )
        .await;

        self.require_execution(execution_id).await
    }

    // ========================================================================
    // Row codecs - the single deserialization routine per aggregate
    // ========================================================================

    fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowDefinition, StoreError> {
        let uuid: String = row.try_get("uuid")?;
        let definition: String = row.try_get("definition")?;
        let tags: String = row.try_get("tags")?;
        let metadata: String = row.try_get("metadata")?;
        let status: String = row.try_get("status")?;
        let visibility: String = row.try_get("visibility")?;

        Ok(WorkflowDefinition {
            workflow_id: row.try_get("workflow_id")?,
            uuid: Uuid::parse_str(&uuid).map_err(|_| StoreError::not_found("workflow", uuid))?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            definition: serde_json::from_str(&definition)?,
            category: row.try_get("category")?,
            tags: serde_json::from_str(&tags)?,
            status: parse_enum(&status)?,
            visibility: parse_enum(&visibility)?,
            metadata: serde_json::from_str(&metadata)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_execution(row: &SqliteRow) -> Result<WorkflowExecution, StoreError> {
        let input_parameters: String = row.try_get("input_parameters")?;
        let output_result: Option<String> = row.try_get("output_result")?;
        let execution_state: String = row.try_get("execution_state")?;
        let compensated_nodes: String = row.try_get("compensated_nodes")?;
        let status: String = row.try_get("status")?;
        let compensation_status: String = row.try_get("compensation_status")?;

        Ok(WorkflowExecution {
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            input_parameters: serde_json::from_str(&input_parameters)?,
            output_result: output_result
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            status: parse_enum(&status)?,
            current_node_id: row.try_get("current_node_id")?,
            execution_state: serde_json::from_str(&execution_state)?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            compensation_required: row.try_get("compensation_required")?,
            compensation_status: parse_enum(&compensation_status)?,
            compensated_nodes: serde_json::from_str(&compensated_nodes)?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            trace_id: row.try_get("trace_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_node_execution(row: &SqliteRow) -> Result<WorkflowNodeExecution, StoreError> {
        let input_data: String = row.try_get("input_data")?;
        let output_data: Option<String> = row.try_get("output_data")?;
        let status: String = row.try_get("status")?;

        Ok(WorkflowNodeExecution {
            node_execution_id: row.try_get("node_execution_id")?,
            execution_id: row.try_get("execution_id")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            status: parse_enum(&status)?,
            input_data: serde_json::from_str(&input_data)?,
            output_data: output_data.map(|s| serde_json::from_str(&s)).transpose()?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            compensation_action: row.try_get("compensation_action")?,
            compensated: row.try_get("compensated")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_trigger(row: &SqliteRow) -> Result<WorkflowTrigger, StoreError> {
        let trigger_config: String = row.try_get("trigger_config")?;
        let trigger_type: String = row.try_get("trigger_type")?;

        Ok(WorkflowTrigger {
            trigger_id: row.try_get("trigger_id")?,
            workflow_id: row.try_get("workflow_id")?,
            trigger_type: parse_enum(&trigger_type)?,
            trigger_config: serde_json::from_str(&trigger_config)?,
            enabled: row.try_get("enabled")?,
            last_triggered_at: row.try_get("last_triggered_at")?,
            trigger_count: row.try_get("trigger_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_approval(row: &SqliteRow) -> Result<ApprovalRequest, StoreError> {
        let request_data: String = row.try_get("request_data")?;
        let response_data: String = row.try_get("response_data")?;
        let status: String = row.try_get("status")?;

        Ok(ApprovalRequest {
            approval_id: row.try_get("approval_id")?,
            execution_id: row.try_get("execution_id")?,
            node_id: row.try_get("node_id")?,
            request_type: row.try_get("request_type")?,
            request_message: row.try_get("request_message")?,
            request_data: serde_json::from_str(&request_data)?,
            status: parse_enum(&status)?,
            responded_by: row.try_get("responded_by")?,
            response_data: serde_json::from_str(&response_data)?,
            responded_at: row.try_get("responded_at")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use chrono::Duration;

    async fn memory_store() -> WorkflowStore {
        WorkflowStore::connect("sqlite::memory:", Arc::new(LocalEventBus::new()))
            .await
            .unwrap()
    }

    fn sample_workflow(name: &str) -> WorkflowDefinitionCreate {
        WorkflowDefinitionCreate {
            name: name.to_string(),
            description: Some("test workflow".to_string()),
            version: "1.0.0".to_string(),
            definition: WorkflowDefinitionBody {
                paradigm: "dag".to_string(),
                nodes: vec![json!({"id": "n1", "type": "task"})],
                edges: vec![],
                entry_node_id: Some("n1".to_string()),
                parameters: vec![],
            },
            category: Some("test".to_string()),
            tags: vec!["demo".to_string()],
            visibility: Visibility::Private,
            metadata: empty_object(),
        }
    }

    async fn sample_execution(store: &WorkflowStore) -> WorkflowExecution {
        let workflow = store.create_workflow(sample_workflow("wf")).await.unwrap();
        store
            .create_execution(WorkflowExecutionCreate {
                workflow_id: workflow.workflow_id,
                parameters: json!({"input": 1}),
                trace_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_workflow_crud_and_archive() {
        let store = memory_store().await;

        let created = store.create_workflow(sample_workflow("alpha")).await.unwrap();
        assert_eq!(created.status, WorkflowStatus::Draft);
        assert!(created.workflow_id.starts_with("wf_"));

        let fetched = store.get_workflow(&created.workflow_id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "alpha");
        assert_eq!(fetched.definition.paradigm, "dag");

        let updated = store
            .update_workflow(
                &created.workflow_id,
                WorkflowDefinitionUpdate {
                    status: Some(WorkflowStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, WorkflowStatus::Active);

        // Archive drops it from listings but the row remains.
        assert!(store.delete_workflow(&created.workflow_id).await.unwrap());
        let page = store.list_workflows(None, None, 10, 0).await.unwrap();
        assert_eq!(page.total, 0);
        let archived = store.get_workflow(&created.workflow_id).await.unwrap().unwrap();
        assert_eq!(archived.status, WorkflowStatus::Archived);
    }

    #[tokio::test]
    async fn test_execution_lifecycle_sets_timestamps() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.started_at.is_none());

        let started = store.start_execution(&execution.execution_id).await.unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        let started_at = started.started_at.unwrap();

        // Starting again must not move started_at.
        let restarted = store.start_execution(&execution.execution_id).await.unwrap();
        assert_eq!(restarted.started_at.unwrap(), started_at);

        let completed = store
            .complete_execution(&execution.execution_id, json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(completed.status, ExecutionStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert!(completed.duration_ms.unwrap() >= 0);
        assert_eq!(completed.output_result.unwrap()["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_fail_execution_records_error() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;
        store.start_execution(&execution.execution_id).await.unwrap();

        let failed = store
            .fail_execution(&execution.execution_id, "E11300", "remote blew up")
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("E11300"));
    }

    #[tokio::test]
    async fn test_approval_gating_transitions_execution() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;
        store.start_execution(&execution.execution_id).await.unwrap();

        let approval = store
            .create_approval_request(ApprovalRequestCreate {
                execution_id: execution.execution_id.clone(),
                node_id: Some("n1".to_string()),
                request_type: "gate".to_string(),
                request_message: "proceed?".to_string(),
                request_data: empty_object(),
                expires_at: None,
            })
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);

        // Pending approval implies the execution is waiting.
        let waiting = store.get_execution(&execution.execution_id).await.unwrap().unwrap();
        assert_eq!(waiting.status, ExecutionStatus::WaitingApproval);

        let pending = store
            .list_pending_approvals(Some(&execution.execution_id))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let responded = store
            .respond_to_approval(
                &approval.approval_id,
                ApprovalResponse {
                    approved: true,
                    responded_by: "operator".to_string(),
                    response_data: empty_object(),
                },
            )
            .await
            .unwrap();
        assert_eq!(responded.status, ApprovalStatus::Approved);

        let resumed = store.get_execution(&execution.execution_id).await.unwrap().unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_responding_to_non_pending_approval_is_rejected() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;

        let approval = store
            .create_approval_request(ApprovalRequestCreate {
                execution_id: execution.execution_id.clone(),
                node_id: None,
                request_type: "gate".to_string(),
                request_message: "proceed?".to_string(),
                request_data: empty_object(),
                expires_at: None,
            })
            .await
            .unwrap();

        let response = ApprovalResponse {
            approved: false,
            responded_by: "operator".to_string(),
            response_data: empty_object(),
        };
        store
            .respond_to_approval(&approval.approval_id, response.clone())
            .await
            .unwrap();

        let err = store
            .respond_to_approval(&approval.approval_id, response)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_expire_old_approvals() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;

        store
            .create_approval_request(ApprovalRequestCreate {
                execution_id: execution.execution_id.clone(),
                node_id: None,
                request_type: "gate".to_string(),
                request_message: "stale".to_string(),
                request_data: empty_object(),
                expires_at: Some(Utc::now() - Duration::minutes(5)),
            })
            .await
            .unwrap();

        let expired = store.expire_old_approvals().await.unwrap();
        assert_eq!(expired, 1);
        assert!(store
            .list_pending_approvals(None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_compensation_tracking() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;
        store.start_execution(&execution.execution_id).await.unwrap();

        for node_id in ["n1", "n2"] {
            store
                .record_node_execution(NodeExecutionCreate {
                    execution_id: execution.execution_id.clone(),
                    node_id: node_id.to_string(),
                    node_type: "task".to_string(),
                    input_data: empty_object(),
                    max_retries: 3,
                    compensation_action: Some("undo".to_string()),
                })
                .await
                .unwrap();
        }

        let marked = store.mark_for_compensation(&execution.execution_id).await.unwrap();
        assert!(marked.compensation_required);
        assert_eq!(marked.status, ExecutionStatus::Compensating);
        assert_eq!(marked.compensation_status, CompensationStatus::Pending);

        store
            .record_compensated_node(&execution.execution_id, "n2")
            .await
            .unwrap();
        store
            .record_compensated_node(&execution.execution_id, "n1")
            .await
            .unwrap();

        let after = store.get_execution(&execution.execution_id).await.unwrap().unwrap();
        assert_eq!(after.compensated_nodes, vec!["n2", "n1"]);

        let nodes = store.list_node_executions(&execution.execution_id).await.unwrap();
        assert!(nodes.iter().all(|n| n.compensated));
        assert!(nodes
            .iter()
            .all(|n| n.status == NodeExecutionStatus::Compensated));

        let done = store.complete_compensation(&execution.execution_id).await.unwrap();
        assert_eq!(done.compensation_status, CompensationStatus::Completed);
    }

    #[tokio::test]
    async fn test_node_execution_lifecycle() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;

        let node = store
            .record_node_execution(NodeExecutionCreate {
                execution_id: execution.execution_id.clone(),
                node_id: "n1".to_string(),
                node_type: "task".to_string(),
                input_data: json!({"x": 1}),
                max_retries: 2,
                compensation_action: None,
            })
            .await
            .unwrap();
        assert_eq!(node.status, NodeExecutionStatus::Running);

        let completed = store
            .complete_node_execution(&node.node_execution_id, json!({"y": 2}))
            .await
            .unwrap();
        assert_eq!(completed.status, NodeExecutionStatus::Completed);
        assert!(completed.duration_ms.unwrap() >= 0);

        let detail = store
            .get_execution_detail(&execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.node_executions.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_fire_counter() {
        let store = memory_store().await;
        let workflow = store.create_workflow(sample_workflow("wf")).await.unwrap();

        let trigger = store
            .create_trigger(WorkflowTriggerCreate {
                workflow_id: workflow.workflow_id,
                trigger_type: TriggerType::Schedule,
                trigger_config: json!({"cron": "0 * * * *"}),
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(trigger.trigger_count, 0);

        store.record_trigger_fired(&trigger.trigger_id).await.unwrap();
        store.record_trigger_fired(&trigger.trigger_id).await.unwrap();

        let fired = store.get_trigger(&trigger.trigger_id).await.unwrap().unwrap();
        assert_eq!(fired.trigger_count, 2);
        assert!(fired.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_save_and_restore() {
        let store = memory_store().await;
        let execution = sample_execution(&store).await;

        let state = json!({"current_node": "n2", "outputs": {"n1": 42}});
        let checkpoint_id = store
            .save_checkpoint(&execution.execution_id, state.clone())
            .await
            .unwrap();
        assert!(checkpoint_id.starts_with("ckpt_"));

        let restored = store
            .restore_checkpoint(&execution.execution_id, &checkpoint_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored, state);

        assert!(store
            .restore_checkpoint(&execution.execution_id, "ckpt_missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mutations_emit_change_events() {
        let bus = Arc::new(LocalEventBus::new());
        let store = WorkflowStore::connect("sqlite::memory:", bus.clone())
            .await
            .unwrap();
        let mut rx = bus.subscribe().await.unwrap();

        let workflow = store.create_workflow(sample_workflow("wf")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "workflow.created");
        assert_eq!(event.aggregate_id, workflow.workflow_id);
        assert_eq!(event.version, 1);
    }
}
