//! Validates atomic units by running their acceptance criteria.

use crate::decomposer::{AtomicUnit, Criterion};
use crate::executor::UnitExecutor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: String,
    pub status: ValidationStatus,
    pub command: String,
    pub output: String,
    pub error: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub unit_id: String,
    pub passed: bool,
    pub status: ValidationStatus,
    pub criterion_results: Vec<CriterionResult>,
    pub total_duration_ms: i64,
}

impl ValidationResult {
    pub fn passed_criteria(&self) -> impl Iterator<Item = &CriterionResult> {
        self.criterion_results
            .iter()
            .filter(|r| r.status == ValidationStatus::Passed)
    }

    pub fn failed_criteria(&self) -> impl Iterator<Item = &CriterionResult> {
        self.criterion_results.iter().filter(|r| {
            matches!(r.status, ValidationStatus::Failed | ValidationStatus::Timeout)
        })
    }
}

pub struct UnitValidator {
    runner: UnitExecutor,
    default_timeout: Duration,
    validation_count: AtomicU64,
    pass_count: AtomicU64,
}

impl UnitValidator {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner: UnitExecutor::new(working_dir),
            default_timeout: Duration::from_secs(60),
            validation_count: AtomicU64::new(0),
            pass_count: AtomicU64::new(0),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run every criterion. A unit passes when no criterion ends up in a
    /// state other than passed or skipped.
    pub async fn validate(&self, unit: &AtomicUnit) -> ValidationResult {
        self.validate_with(unit, false).await
    }

    /// As [`validate`], optionally fanning the criteria out in parallel.
    /// Per-criterion ordering within a unit is irrelevant.
    pub async fn validate_with(&self, unit: &AtomicUnit, parallel: bool) -> ValidationResult {
        let started = std::time::Instant::now();
        info!(unit_id = %unit.id, title = %unit.title, "Validating unit");

        let criterion_results: Vec<CriterionResult> = if parallel {
            futures::future::join_all(
                unit.acceptance_criteria
                    .iter()
                    .map(|c| self.validate_criterion(c)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(unit.acceptance_criteria.len());
            for criterion in &unit.acceptance_criteria {
                results.push(self.validate_criterion(criterion).await);
            }
            results
        };

        let all_passed = criterion_results
            .iter()
            .all(|r| matches!(r.status, ValidationStatus::Passed | ValidationStatus::Skipped));

        for result in &criterion_results {
            if !matches!(result.status, ValidationStatus::Passed | ValidationStatus::Skipped) {
                warn!(
                    criterion_id = %result.criterion_id,
                    status = ?result.status,
                    "Criterion failed: {}",
                    if result.error.is_empty() { &result.output } else { &result.error }
                );
            }
        }

        self.validation_count.fetch_add(1, Ordering::Relaxed);
        if all_passed {
            self.pass_count.fetch_add(1, Ordering::Relaxed);
        }

        let result = ValidationResult {
            unit_id: unit.id.clone(),
            passed: all_passed,
            status: if all_passed {
                ValidationStatus::Passed
            } else {
                ValidationStatus::Failed
            },
            criterion_results,
            total_duration_ms: started.elapsed().as_millis() as i64,
        };

        info!(
            unit_id = %unit.id,
            passed = all_passed,
            criteria = result.criterion_results.len(),
            "Unit validation complete"
        );
        result
    }

    async fn validate_criterion(&self, criterion: &Criterion) -> CriterionResult {
        if criterion.is_manual() {
            return CriterionResult {
                criterion_id: criterion.id.clone(),
                status: ValidationStatus::Skipped,
                command: criterion.validation_command.clone(),
                output: "Manual verification required - skipped in automated run".to_string(),
                error: String::new(),
                duration_ms: 0,
            };
        }

        let timeout = if criterion.timeout_seconds > 0 {
            Duration::from_secs(criterion.timeout_seconds)
        } else {
            self.default_timeout
        };

        let command_result = self
            .runner
            .run_command(&criterion.validation_command, timeout)
            .await;

        let status = if command_result.timed_out {
            ValidationStatus::Timeout
        } else {
            let passed = if criterion.expected_result == "success" {
                command_result.return_code == 0
            } else {
                command_result.stdout.contains(&criterion.expected_result)
            };
            if passed {
                ValidationStatus::Passed
            } else {
                ValidationStatus::Failed
            }
        };

        CriterionResult {
            criterion_id: criterion.id.clone(),
            status,
            command: criterion.validation_command.clone(),
            output: command_result.stdout,
            error: command_result.stderr,
            duration_ms: command_result.duration_ms,
        }
    }

    /// Validate several units, optionally in parallel across units.
    pub async fn validate_batch(
        &self,
        units: &[AtomicUnit],
        parallel: bool,
    ) -> Vec<ValidationResult> {
        if parallel {
            futures::future::join_all(units.iter().map(|u| self.validate_with(u, true))).await
        } else {
            let mut results = Vec::with_capacity(units.len());
            for unit in units {
                results.push(self.validate(unit).await);
            }
            results
        }
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let validations = self.validation_count.load(Ordering::Relaxed);
        let passes = self.pass_count.load(Ordering::Relaxed);
        serde_json::json!({
            "validation_count": validations,
            "pass_count": passes,
            "pass_rate": if validations > 0 {
                passes as f64 / validations as f64
            } else {
                0.0
            },
        })
    }
}
