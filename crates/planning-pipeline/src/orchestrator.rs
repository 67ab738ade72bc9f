//! Pipeline orchestrator: the state machine of record for one execution.
//!
//! Drives parse -> decompose -> execute -> validate -> score -> (rollback),
//! emitting lifecycle events, persisting results through the bridges, and
//! snapshotting the working tree before every unit. Store and publish
//! failures never abort the pipeline; they are logged and surfaced in the
//! result metadata.

use crate::bridges::data::DataBridge;
use crate::bridges::mesh::{EventType, MeshBridge};
use crate::bridges::Bridge;
use crate::bridges::scoring::{AssessmentLevel, ScoringBridge};
use crate::checkpoint::CheckpointManager;
use crate::decomposer::{AtomicUnit, SpecDecomposer};
use crate::executor::{ExecutionResult, ExecutionStatus, UnitExecutor};
use crate::parser::PlanParser;
use crate::validator::{UnitValidator, ValidationResult};
use crate::PipelineError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Working directories currently owned by an execution. One execution per
/// directory at a time, enforced at start.
static ACTIVE_WORKING_DIRS: Lazy<Mutex<HashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

struct WorkingDirGuard(PathBuf);

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        ACTIVE_WORKING_DIRS.lock().remove(&self.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Parsing,
    Decomposing,
    Executing,
    Validating,
    Scoring,
    Recovering,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    pub unit_title: String,
    pub execution_result: Option<ExecutionResult>,
    pub validation_result: Option<ValidationResult>,
    pub quality_score: f64,
    pub checkpoint_hash: Option<String>,
    pub status: PipelineStatus,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl UnitResult {
    fn pending(unit: &AtomicUnit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            unit_title: unit.title.clone(),
            execution_result: None,
            validation_result: None,
            quality_score: 0.0,
            checkpoint_hash: None,
            status: PipelineStatus::Pending,
            error: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub execution_id: String,
    pub plan_id: String,
    pub status: PipelineStatus,
    pub unit_results: Vec<UnitResult>,
    pub total_units: usize,
    pub passed_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
    pub average_score: f64,
    pub overall_assessment: Option<AssessmentLevel>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub metadata: Map<String, Value>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.status == PipelineStatus::Completed && self.failed_units == 0
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub working_dir: PathBuf,
    pub dry_run: bool,
    pub sandbox: bool,
    pub stop_on_failure: bool,
    pub parallel_validation: bool,
    pub quality_threshold: f64,
    pub variables: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            dry_run: false,
            sandbox: true,
            stop_on_failure: true,
            parallel_validation: false,
            quality_threshold: 70.0,
            variables: HashMap::new(),
        }
    }
}

/// Cooperative cancellation: checked between units; the unit in flight is
/// recorded as skipped and the loop suspends before the next one.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelSignal(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

pub struct PipelineOrchestrator {
    working_dir: PathBuf,
    parser: PlanParser,
    checkpoint_manager: CheckpointManager,
    scoring_bridge: Arc<ScoringBridge>,
    data_bridge: Arc<DataBridge>,
    mesh_bridge: Arc<MeshBridge>,
    history: Mutex<HashMap<String, PipelineResult>>,
}

impl PipelineOrchestrator {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        data_bridge: Arc<DataBridge>,
        mesh_bridge: Arc<MeshBridge>,
    ) -> Self {
        let working_dir = working_dir.into();
        let checkpoint_manager = CheckpointManager::new(
            working_dir.clone(),
            working_dir.join(".checkpoints"),
        );
        Self {
            working_dir,
            parser: PlanParser::new(),
            checkpoint_manager,
            scoring_bridge: Arc::new(ScoringBridge::new()),
            data_bridge,
            mesh_bridge,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn offline(working_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            working_dir,
            Arc::new(DataBridge::offline()),
            Arc::new(MeshBridge::offline()),
        )
    }

    pub fn scoring_bridge(&self) -> &Arc<ScoringBridge> {
        &self.scoring_bridge
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// Execute a markdown plan through the full pipeline.
    pub async fn execute_plan_markdown(
        &self,
        markdown: &str,
        context: ExecutionContext,
        cancel: Option<CancelSignal>,
    ) -> Result<PipelineResult, PipelineError> {
        let _guard = self.claim_working_dir(&context.working_dir)?;

        let execution_id = format!(
            "exec-{}-{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..6]
        );
        let started_at = Utc::now();
        info!(execution_id = %execution_id, "Starting pipeline execution");

        let mut result = PipelineResult {
            execution_id: execution_id.clone(),
            plan_id: String::new(),
            status: PipelineStatus::Pending,
            unit_results: Vec::new(),
            total_units: 0,
            passed_units: 0,
            failed_units: 0,
            skipped_units: 0,
            average_score: 0.0,
            overall_assessment: None,
            started_at,
            completed_at: None,
            duration_ms: 0,
            metadata: Map::new(),
        };

        // Parse.
        result.status = PipelineStatus::Parsing;
        let plan = match self.parser.parse(markdown) {
            Ok(plan) => plan,
            Err(e) => {
                error!(execution_id = %execution_id, "Parse failed: {}", e);
                result.status = PipelineStatus::Failed;
                result
                    .metadata
                    .insert("error".to_string(), json!(e.to_string()));
                self.mesh_bridge
                    .publish_plan_failed("unknown", &e.to_string(), &execution_id)
                    .await;
                return Ok(self.finalize(result, started_at).await);
            }
        };
        result.plan_id = plan.plan_id.clone();

        self.mesh_bridge
            .publish_plan_started(&plan.plan_id, plan.steps.len(), &execution_id)
            .await;

        // Decompose.
        result.status = PipelineStatus::Decomposing;
        let mut decomposer = SpecDecomposer::new();
        decomposer.decompose(&plan);
        let ordered_units = decomposer.execution_order();
        result.total_units = ordered_units.len();

        let store_result = self
            .data_bridge
            .store_plan(
                &plan.plan_id,
                json!({
                    "execution_id": execution_id,
                    "title": plan.title,
                    "format_type": plan.format_type,
                    "unit_count": ordered_units.len(),
                    "status": "executing",
                }),
            )
            .await;
        if !store_result.success {
            self.note_bridge_failure(&mut result, "store_plan", store_result.error);
        }

        // Execute units in topological order.
        result.status = PipelineStatus::Executing;
        let executor = UnitExecutor::new(context.working_dir.clone())
            .with_sandbox(context.sandbox)
            .with_dry_run(context.dry_run);
        let validator = UnitValidator::new(context.working_dir.clone());

        let total = ordered_units.len();
        for (index, unit) in ordered_units.iter().enumerate() {
            if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                info!(execution_id = %execution_id, unit_id = %unit.id, "Cancelled, skipping remaining units");
                let mut skipped = UnitResult::pending(unit);
                skipped.error = Some("cancelled".to_string());
                result.unit_results.push(skipped);
                result.skipped_units += total - index;
                break;
            }

            info!(
                execution_id = %execution_id,
                unit_id = %unit.id,
                "[{}/{}] Executing unit", index + 1, total
            );

            let unit_result = self
                .execute_unit(unit, &context, &plan.plan_id, &execution_id, &executor, &validator)
                .await;

            let failed = unit_result.status == PipelineStatus::Failed;
            match unit_result.status {
                PipelineStatus::Completed => result.passed_units += 1,
                PipelineStatus::Failed => result.failed_units += 1,
                _ => result.skipped_units += 1,
            }
            result.unit_results.push(unit_result);

            if failed && context.stop_on_failure {
                warn!(execution_id = %execution_id, unit_id = %unit.id, "Stopping on failure");
                result.skipped_units += total - index - 1;
                break;
            }
        }

        // Final scoring.
        result.status = PipelineStatus::Scoring;
        self.calculate_final_score(&mut result);

        result.status = if result.failed_units == 0 || result.passed_units > 0 {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Failed
        };

        match result.status {
            PipelineStatus::Completed => {
                self.mesh_bridge
                    .publish_plan_completed(
                        &plan.plan_id,
                        result.passed_units,
                        result.failed_units,
                        result.average_score,
                        &execution_id,
                    )
                    .await;
            }
            _ => {
                self.mesh_bridge
                    .publish_plan_failed(&plan.plan_id, "all units failed", &execution_id)
                    .await;
            }
        }

        Ok(self.finalize(result, started_at).await)
    }

    async fn execute_unit(
        &self,
        unit: &AtomicUnit,
        context: &ExecutionContext,
        plan_id: &str,
        execution_id: &str,
        executor: &UnitExecutor,
        validator: &UnitValidator,
    ) -> UnitResult {
        let started = std::time::Instant::now();
        let mut unit_result = UnitResult::pending(unit);

        let store_result = self
            .data_bridge
            .store_unit(
                &unit.id,
                plan_id,
                json!({
                    "title": unit.title,
                    "description": unit.description,
                    "files": unit.files,
                    "complexity": unit.complexity,
                }),
            )
            .await;
        if !store_result.success {
            warn!(unit_id = %unit.id, "Unit store failed: {:?}", store_result.error);
        }

        self.mesh_bridge
            .publish_unit_started(&unit.id, plan_id, execution_id)
            .await;

        // Checkpoint before touching the tree.
        match self.checkpoint_manager.create_checkpoint(
            &format!("pre-{}", unit.id),
            &unit.id,
            json!({"execution_id": execution_id}),
        ) {
            Ok(checkpoint) => {
                unit_result.checkpoint_hash = Some(checkpoint.hash.clone());
                self.mesh_bridge
                    .publish_event(
                        EventType::CheckpointCreated,
                        json!({
                            "plan_id": plan_id,
                            "unit_id": unit.id,
                            "checkpoint_hash": checkpoint.hash,
                        }),
                        Some(execution_id),
                    )
                    .await;
            }
            Err(e) => {
                warn!(unit_id = %unit.id, "Checkpoint creation failed: {}", e);
            }
        }

        // Execute.
        unit_result.status = PipelineStatus::Executing;
        let execution = executor.execute(unit, &context.variables).await;
        let execution_failed = execution.status != ExecutionStatus::Success;
        let execution_error = execution.error.clone();
        unit_result.execution_result = Some(execution);

        if execution_failed && !context.dry_run {
            unit_result.status = PipelineStatus::Failed;
            unit_result.error = execution_error.or_else(|| Some("Execution failed".to_string()));
            self.mesh_bridge
                .publish_unit_failed(
                    &unit.id,
                    plan_id,
                    unit_result.error.as_deref().unwrap_or(""),
                    execution_id,
                )
                .await;
            unit_result.duration_ms = started.elapsed().as_millis() as i64;
            return unit_result;
        }

        // Validate.
        unit_result.status = PipelineStatus::Validating;
        let validation = validator
            .validate_with(unit, context.parallel_validation)
            .await;

        // Score.
        unit_result.status = PipelineStatus::Scoring;
        let score = self.scoring_bridge.score_unit(unit, Some(&validation));
        unit_result.quality_score = score.score;

        let store_result = self
            .data_bridge
            .store_validation(
                &unit.id,
                json!({
                    "passed": validation.passed,
                    "status": validation.status,
                    "quality_score": score.score,
                    "assessment": score.assessment,
                }),
            )
            .await;
        if !store_result.success {
            warn!(unit_id = %unit.id, "Validation store failed: {:?}", store_result.error);
        }

        let passed = validation.passed && score.score >= context.quality_threshold;
        unit_result.validation_result = Some(validation);

        if passed {
            unit_result.status = PipelineStatus::Completed;
            self.mesh_bridge
                .publish_unit_completed(&unit.id, plan_id, score.score, execution_id)
                .await;
        } else {
            unit_result.status = PipelineStatus::Failed;
            unit_result.error = Some(format!(
                "Validation {}, score={:.1}",
                if unit_result
                    .validation_result
                    .as_ref()
                    .map(|v| v.passed)
                    .unwrap_or(false)
                {
                    "passed"
                } else {
                    "failed"
                },
                score.score
            ));
            self.mesh_bridge
                .publish_unit_failed(
                    &unit.id,
                    plan_id,
                    unit_result.error.as_deref().unwrap_or(""),
                    execution_id,
                )
                .await;
        }

        unit_result.duration_ms = started.elapsed().as_millis() as i64;
        unit_result
    }

    /// Average over units that produced a score; assessment per the fixed
    /// buckets.
    fn calculate_final_score(&self, result: &mut PipelineResult) {
        let scores: Vec<f64> = result
            .unit_results
            .iter()
            .map(|u| u.quality_score)
            .filter(|s| *s > 0.0)
            .collect();

        result.average_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        result.overall_assessment = Some(AssessmentLevel::from_score(result.average_score));
    }

    async fn finalize(
        &self,
        mut result: PipelineResult,
        started_at: DateTime<Utc>,
    ) -> PipelineResult {
        let completed_at = Utc::now();
        result.completed_at = Some(completed_at);
        result.duration_ms = (completed_at - started_at).num_milliseconds();

        let store_result = self
            .data_bridge
            .store_execution(
                &result.execution_id,
                json!({
                    "plan_id": result.plan_id,
                    "status": result.status,
                    "passed_units": result.passed_units,
                    "failed_units": result.failed_units,
                    "average_score": result.average_score,
                    "duration_ms": result.duration_ms,
                }),
            )
            .await;
        if !store_result.success {
            self.note_bridge_failure(&mut result, "store_execution", store_result.error);
        }

        info!(
            execution_id = %result.execution_id,
            passed = result.passed_units,
            failed = result.failed_units,
            score = format!("{:.1}", result.average_score),
            "Pipeline execution complete"
        );

        self.history
            .lock()
            .insert(result.execution_id.clone(), result.clone());
        result
    }

    fn note_bridge_failure(
        &self,
        result: &mut PipelineResult,
        operation: &str,
        error: Option<String>,
    ) {
        warn!(operation, "Bridge call failed: {:?}", error);
        let failures = result
            .metadata
            .entry("bridge_failures".to_string())
            .or_insert_with(|| json!([]));
        if let Some(list) = failures.as_array_mut() {
            list.push(json!({"operation": operation, "error": error}));
        }
    }

    fn claim_working_dir(&self, dir: &PathBuf) -> Result<WorkingDirGuard, PipelineError> {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        let mut active = ACTIVE_WORKING_DIRS.lock();
        if !active.insert(canonical.clone()) {
            return Err(PipelineError::WorkingDirBusy {
                dir: canonical,
                owner: "another execution".to_string(),
            });
        }
        Ok(WorkingDirGuard(canonical))
    }

    pub fn get_execution_status(&self, execution_id: &str) -> Option<PipelineResult> {
        self.history.lock().get(execution_id).cloned()
    }

    /// Walk unit results in reverse and restore the first checkpoint whose
    /// hash still resolves; the execution ends rolled back.
    pub async fn rollback_execution(&self, execution_id: &str) -> Result<bool, PipelineError> {
        let Some(result) = self.get_execution_status(execution_id) else {
            warn!(execution_id, "Execution not found for rollback");
            return Ok(false);
        };

        info!(execution_id, "Rolling back execution");

        for unit_result in result.unit_results.iter().rev() {
            let Some(hash) = &unit_result.checkpoint_hash else {
                continue;
            };
            let Some(checkpoint) = self.checkpoint_manager.get_checkpoint_by_hash(hash) else {
                continue;
            };

            if self
                .checkpoint_manager
                .restore_checkpoint(&checkpoint.checkpoint_id)?
            {
                self.mesh_bridge
                    .publish_event(
                        EventType::RollbackCompleted,
                        json!({
                            "plan_id": result.plan_id,
                            "execution_id": execution_id,
                            "checkpoint_hash": checkpoint.hash,
                        }),
                        Some(execution_id),
                    )
                    .await;

                let mut history = self.history.lock();
                if let Some(stored) = history.get_mut(execution_id) {
                    stored.status = PipelineStatus::RolledBack;
                }
                return Ok(true);
            }
        }

        warn!(execution_id, "No restorable checkpoint found");
        Ok(false)
    }

    pub fn get_statistics(&self) -> Value {
        let history = self.history.lock();
        let total = history.len();
        let successful = history.values().filter(|r| r.success()).count();
        json!({
            "total_executions": total,
            "successful_executions": successful,
            "success_rate": if total > 0 { successful as f64 / total as f64 } else { 0.0 },
            "working_dir": self.working_dir.display().to_string(),
            "bridges": {
                "data_connected": self.data_bridge.is_connected(),
                "mesh_connected": self.mesh_bridge.is_connected(),
            },
        })
    }
}
