//! End-to-end pipeline runs against a real temporary working tree.

use planning_pipeline::{
    CancelSignal, EventType, ExecutionContext, PipelineOrchestrator, PipelineStatus,
};
use serde_json::json;

fn context_for(dir: &std::path::Path) -> ExecutionContext {
    let mut context = ExecutionContext::new(dir);
    // Unit files named test_* select test execution; run a no-op test
    // command so the scenarios stay hermetic.
    context
        .variables
        .insert("test_command".to_string(), json!("true"));
    context
}

const PHASE_PLAN: &str = r#"# My Feature Plan
## Phase 1: Foundation
### 1.1 Create file
Files to create: a.txt
### 1.2 Tests
Files to create: test_a.txt
Depends: step-1
"#;

#[tokio::test]
async fn test_happy_path_phase_plan() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let result = orchestrator
        .execute_plan_markdown(PHASE_PLAN, context_for(dir.path()), None)
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(result.success());
    assert_eq!(result.total_units, 2);
    assert_eq!(result.passed_units, 2);
    assert_eq!(result.failed_units, 0);

    // Topological order: the dependency ran first.
    let order: Vec<&str> = result.unit_results.iter().map(|u| u.unit_id.as_str()).collect();
    assert_eq!(order, vec!["step-1", "step-2"]);

    // Files were really created.
    assert!(dir.path().join("a.txt").exists());
    assert!(dir.path().join("test_a.txt").exists());

    // Assessment lands in the upper buckets for a clean run.
    let assessment = result.overall_assessment.unwrap();
    assert!(matches!(
        assessment,
        planning_pipeline::AssessmentLevel::Good | planning_pipeline::AssessmentLevel::Excellent
    ));
}

#[tokio::test]
async fn test_dependency_cycle_is_broken_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let markdown = r#"# Plan: cycle

## Steps
1. **First**
   Files: one.txt
   Depends: step-2
2. **Second**
   Files: two.txt
   Depends: step-1
"#;

    let result = orchestrator
        .execute_plan_markdown(markdown, context_for(dir.path()), None)
        .await
        .unwrap();

    // Both units processed exactly once.
    assert_eq!(result.unit_results.len(), 2);
    let ids: std::collections::HashSet<&str> = result
        .unit_results
        .iter()
        .map(|u| u.unit_id.as_str())
        .collect();
    assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn test_sandbox_violation_fails_with_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let markdown = r#"# Plan: escape

## Steps
1. **Write outside**
   Files: /etc/passwd-shadow-copy
"#;

    let mut context = context_for(dir.path());
    context.sandbox = true;

    let result = orchestrator
        .execute_plan_markdown(markdown, context, None)
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.failed_units, 1);

    let unit = &result.unit_results[0];
    let execution = unit.execution_result.as_ref().unwrap();
    assert!(execution
        .error
        .as_deref()
        .unwrap()
        .contains("outside sandbox"));
    assert!(execution.files_created.is_empty());

    // The pre-unit checkpoint exists and rollback resolves it.
    assert!(unit.checkpoint_hash.is_some());
    assert!(orchestrator
        .rollback_execution(&result.execution_id)
        .await
        .unwrap());
    let rolled_back = orchestrator
        .get_execution_status(&result.execution_id)
        .unwrap();
    assert_eq!(rolled_back.status, PipelineStatus::RolledBack);
}

#[tokio::test]
async fn test_parse_error_fails_execution_with_event() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let result = orchestrator
        .execute_plan_markdown("nothing resembling a plan", context_for(dir.path()), None)
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert!(result.metadata.contains_key("error"));
    assert!(result.unit_results.is_empty());
}

#[tokio::test]
async fn test_dry_run_touches_nothing_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let mut context = context_for(dir.path());
    context.dry_run = true;

    let result = orchestrator
        .execute_plan_markdown(PHASE_PLAN, context, None)
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(!dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_cancellation_skips_remaining_units() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let (handle, signal) = CancelSignal::new();
    handle.cancel();

    let result = orchestrator
        .execute_plan_markdown(PHASE_PLAN, context_for(dir.path()), Some(signal))
        .await
        .unwrap();

    assert_eq!(result.passed_units, 0);
    assert_eq!(result.skipped_units, 2);
    assert_eq!(result.unit_results.len(), 1);
    assert_eq!(result.unit_results[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_event_order_within_execution() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = std::sync::Arc::new(planning_pipeline::MeshBridge::offline());
    let data = std::sync::Arc::new(planning_pipeline::DataBridge::offline());
    let orchestrator = PipelineOrchestrator::new(dir.path(), data, mesh.clone());

    let result = orchestrator
        .execute_plan_markdown(PHASE_PLAN, context_for(dir.path()), None)
        .await
        .unwrap();

    let events = mesh.get_events(None, Some(&result.execution_id), 100);
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();

    assert_eq!(types.first(), Some(&EventType::PlanStarted));
    assert_eq!(types.last(), Some(&EventType::PlanCompleted));

    // Each unit's start precedes its completion.
    let start_1 = types
        .iter()
        .position(|t| *t == EventType::UnitStarted)
        .unwrap();
    let complete_1 = types
        .iter()
        .position(|t| *t == EventType::UnitCompleted)
        .unwrap();
    assert!(start_1 < complete_1);

    // Timestamps are non-decreasing in the emitted order.
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn test_stop_on_failure_skips_remainder() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    // The first unit's test command fails; the second never runs.
    let markdown = r#"# Plan: halted

## Steps
1. **Run the tests first**
   Files: test_gate.txt
2. **Then build**
   Files: artifact.txt
   Depends: step-1
"#;

    let mut context = context_for(dir.path());
    context
        .variables
        .insert("test_command".to_string(), json!("false"));

    let result = orchestrator
        .execute_plan_markdown(markdown, context, None)
        .await
        .unwrap();

    assert_eq!(result.failed_units, 1);
    assert_eq!(result.skipped_units, 1);
    assert_eq!(result.unit_results.len(), 1);
    assert!(!dir.path().join("artifact.txt").exists());
}

#[tokio::test]
async fn test_working_dir_is_released_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    for _ in 0..2 {
        let result = orchestrator
            .execute_plan_markdown(PHASE_PLAN, context_for(dir.path()), None)
            .await
            .unwrap();
        assert_eq!(result.status, PipelineStatus::Completed);
    }

    assert_eq!(orchestrator.get_statistics()["total_executions"], 2);
}

#[tokio::test]
async fn test_quality_threshold_gates_completion() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = PipelineOrchestrator::offline(dir.path());

    let mut context = context_for(dir.path());
    context.quality_threshold = 100.0;
    context.stop_on_failure = false;

    let result = orchestrator
        .execute_plan_markdown(PHASE_PLAN, context, None)
        .await
        .unwrap();

    // Execution and validation succeed, but no unit clears the bar.
    assert_eq!(result.passed_units, 0);
    assert_eq!(result.failed_units, 2);
    assert_eq!(result.status, PipelineStatus::Failed);
    assert!(!result.success());
}
