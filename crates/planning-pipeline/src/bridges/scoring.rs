//! Scoring bridge: quality assessment for units and plans.
//!
//! Scores five weighted dimensions and folds in the validation pass rate.
//! When a remote evaluation layer is wired its result would land here; the
//! local computation is the authoritative fallback and carries the same
//! shape either way.

use crate::bridges::Bridge;
use crate::decomposer::{AtomicUnit, Complexity};
use crate::validator::ValidationResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentLevel {
    Excellent,
    Good,
    Acceptable,
    Warning,
    Critical,
}

impl AssessmentLevel {
    /// Bucket a 0-100 score.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 80.0 {
            Self::Good
        } else if score >= 70.0 {
            Self::Acceptable
        } else if score >= 60.0 {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDimension {
    Accuracy,
    Completeness,
    Efficiency,
    Maintainability,
    Testability,
}

const DIMENSION_WEIGHTS: &[(ScoreDimension, f64)] = &[
    (ScoreDimension::Accuracy, 0.25),
    (ScoreDimension::Completeness, 0.25),
    (ScoreDimension::Efficiency, 0.20),
    (ScoreDimension::Maintainability, 0.15),
    (ScoreDimension::Testability, 0.15),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitScore {
    pub unit_id: String,
    pub score: f64,
    pub assessment: AssessmentLevel,
    pub dimensions: HashMap<ScoreDimension, f64>,
    pub validation_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanScore {
    pub plan_id: String,
    pub score: f64,
    pub assessment: AssessmentLevel,
    pub unit_scores: Vec<UnitScore>,
    /// Percentage of units that had validation evidence.
    pub coverage: f64,
}

pub struct ScoringBridge {
    history: Mutex<Vec<UnitScore>>,
    initialized: AtomicBool,
}

impl ScoringBridge {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Score one unit; validation evidence blends in at 30% weight.
    pub fn score_unit(
        &self,
        unit: &AtomicUnit,
        validation: Option<&ValidationResult>,
    ) -> UnitScore {
        debug!(unit_id = %unit.id, "Scoring unit");

        let mut dimensions = HashMap::new();
        dimensions.insert(ScoreDimension::Accuracy, self.score_accuracy(unit, validation));
        dimensions.insert(ScoreDimension::Completeness, self.score_completeness(unit));
        dimensions.insert(ScoreDimension::Efficiency, self.score_efficiency(unit));
        dimensions.insert(
            ScoreDimension::Maintainability,
            self.score_maintainability(unit),
        );
        dimensions.insert(ScoreDimension::Testability, self.score_testability(unit));

        let mut score: f64 = DIMENSION_WEIGHTS
            .iter()
            .map(|(dim, weight)| dimensions[dim] * weight)
            .sum();

        let validation_score = validation
            .map(|v| {
                let total = v.criterion_results.len();
                if total == 0 {
                    0.0
                } else {
                    v.passed_criteria().count() as f64 / total as f64 * 100.0
                }
            })
            .unwrap_or(0.0);

        if validation_score > 0.0 {
            score = score * 0.7 + validation_score * 0.3;
        }

        let unit_score = UnitScore {
            unit_id: unit.id.clone(),
            score,
            assessment: AssessmentLevel::from_score(score),
            dimensions,
            validation_score,
        };

        info!(
            unit_id = %unit.id,
            score = format!("{:.1}", score),
            assessment = ?unit_score.assessment,
            "Unit scored"
        );
        self.history.lock().push(unit_score.clone());
        unit_score
    }

    /// Score a whole plan: average of unit scores plus validation coverage.
    pub fn score_plan(
        &self,
        plan_id: &str,
        units: &[AtomicUnit],
        validations: &HashMap<String, ValidationResult>,
    ) -> PlanScore {
        info!(plan_id, units = units.len(), "Scoring plan");

        let unit_scores: Vec<UnitScore> = units
            .iter()
            .map(|unit| self.score_unit(unit, validations.get(&unit.id)))
            .collect();

        let score = if unit_scores.is_empty() {
            0.0
        } else {
            unit_scores.iter().map(|s| s.score).sum::<f64>() / unit_scores.len() as f64
        };

        let validated = unit_scores.iter().filter(|s| s.validation_score > 0.0).count();
        let coverage = if units.is_empty() {
            0.0
        } else {
            validated as f64 / units.len() as f64 * 100.0
        };

        PlanScore {
            plan_id: plan_id.to_string(),
            score,
            assessment: AssessmentLevel::from_score(score),
            unit_scores,
            coverage,
        }
    }

    /// 0-1 quality estimate over generated plan text; the escalation loop
    /// uses this in place of its own heuristic when the bridge is wired.
    pub fn estimate_plan_quality(&self, content: &str) -> f64 {
        crate::router::estimate_quality(content)
    }

    fn score_accuracy(&self, unit: &AtomicUnit, validation: Option<&ValidationResult>) -> f64 {
        let mut score = 70.0;
        if !unit.acceptance_criteria.is_empty() {
            score += (unit.acceptance_criteria.len() as f64 * 5.0).min(15.0);
        }
        if validation.map(|v| v.passed).unwrap_or(false) {
            score += 15.0;
        }
        score.min(100.0)
    }

    fn score_completeness(&self, unit: &AtomicUnit) -> f64 {
        let mut score = 60.0;
        if unit.description.len() > 50 {
            score += 10.0;
        }
        if unit.description.len() > 100 {
            score += 5.0;
        }
        if !unit.files.is_empty() {
            score += (unit.files.len() as f64 * 5.0).min(15.0);
        }
        if !unit.dependencies.is_empty() {
            score += 5.0;
        }
        if unit.phase.is_some() {
            score += 5.0;
        }
        score.min(100.0)
    }

    fn score_efficiency(&self, unit: &AtomicUnit) -> f64 {
        let mut score: f64 = match unit.complexity {
            Complexity::Low => 90.0,
            Complexity::Medium => 75.0,
            Complexity::High => 60.0,
        };
        if unit.files.len() > 5 {
            score -= 10.0;
        }
        if unit.dependencies.len() > 3 {
            score -= 10.0;
        }
        score.max(30.0)
    }

    fn score_maintainability(&self, unit: &AtomicUnit) -> f64 {
        let mut score: f64 = 70.0;
        match unit.complexity {
            Complexity::Low => score += 15.0,
            Complexity::Medium => score += 5.0,
            Complexity::High => {}
        }
        if !unit.compensation_action.is_empty() {
            score += 10.0;
        }
        score.min(100.0)
    }

    fn score_testability(&self, unit: &AtomicUnit) -> f64 {
        let mut score = 60.0;
        let criteria = unit.acceptance_criteria.len();
        if criteria > 0 {
            score += (criteria as f64 * 10.0).min(30.0);
        }
        if !unit.files.is_empty() {
            score += 10.0;
        }
        score.min(100.0)
    }

    pub fn get_score_history(&self, unit_id: Option<&str>, limit: usize) -> Vec<UnitScore> {
        let history = self.history.lock();
        let filtered: Vec<UnitScore> = history
            .iter()
            .filter(|s| unit_id.map(|id| s.unit_id == id).unwrap_or(true))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

impl Default for ScoringBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bridge for ScoringBridge {
    async fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("ScoringBridge initialized");
        }
    }

    async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn get_statistics(&self) -> Value {
        let history = self.history.lock();
        if history.is_empty() {
            return json!({"total_scores": 0, "average_score": 0.0});
        }
        let scores: Vec<f64> = history.iter().map(|s| s.score).collect();
        let mut distribution: HashMap<String, usize> = HashMap::new();
        for score in history.iter() {
            let key = format!("{:?}", score.assessment).to_lowercase();
            *distribution.entry(key).or_insert(0) += 1;
        }
        json!({
            "total_scores": history.len(),
            "average_score": scores.iter().sum::<f64>() / scores.len() as f64,
            "min_score": scores.iter().cloned().fold(f64::INFINITY, f64::min),
            "max_score": scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            "assessment_distribution": distribution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::Criterion;
    use crate::validator::{CriterionResult, ValidationStatus};

    fn unit(criteria: usize, files: usize, complexity: Complexity) -> AtomicUnit {
        AtomicUnit {
            id: "u1".to_string(),
            title: "unit".to_string(),
            description: "a reasonably descriptive unit body for scoring".to_string(),
            files: (0..files).map(|i| format!("f{}.py", i)).collect(),
            dependencies: vec![],
            acceptance_criteria: (0..criteria)
                .map(|i| Criterion {
                    id: format!("c{}", i),
                    description: "check".to_string(),
                    validation_command: "true".to_string(),
                    expected_result: "success".to_string(),
                    timeout_seconds: 10,
                })
                .collect(),
            phase: None,
            complexity,
            estimated_minutes: 10,
            compensation_action: "git checkout -- .".to_string(),
        }
    }

    fn passing_validation(unit_id: &str, criteria: usize) -> ValidationResult {
        ValidationResult {
            unit_id: unit_id.to_string(),
            passed: true,
            status: ValidationStatus::Passed,
            criterion_results: (0..criteria)
                .map(|i| CriterionResult {
                    criterion_id: format!("c{}", i),
                    status: ValidationStatus::Passed,
                    command: "true".to_string(),
                    output: String::new(),
                    error: String::new(),
                    duration_ms: 1,
                })
                .collect(),
            total_duration_ms: 1,
        }
    }

    #[test]
    fn test_assessment_buckets() {
        assert_eq!(AssessmentLevel::from_score(95.0), AssessmentLevel::Excellent);
        assert_eq!(AssessmentLevel::from_score(90.0), AssessmentLevel::Excellent);
        assert_eq!(AssessmentLevel::from_score(85.0), AssessmentLevel::Good);
        assert_eq!(AssessmentLevel::from_score(75.0), AssessmentLevel::Acceptable);
        assert_eq!(AssessmentLevel::from_score(65.0), AssessmentLevel::Warning);
        assert_eq!(AssessmentLevel::from_score(59.9), AssessmentLevel::Critical);
    }

    #[test]
    fn test_passing_validation_raises_score() {
        let bridge = ScoringBridge::new();
        let u = unit(2, 1, Complexity::Low);

        let bare = bridge.score_unit(&u, None);
        let validated = bridge.score_unit(&u, Some(&passing_validation("u1", 2)));

        assert!(validated.score > bare.score);
        assert_eq!(validated.validation_score, 100.0);
    }

    #[test]
    fn test_validated_low_complexity_unit_scores_good() {
        let bridge = ScoringBridge::new();
        let u = unit(2, 1, Complexity::Low);
        let score = bridge.score_unit(&u, Some(&passing_validation("u1", 2)));
        assert!(score.score >= 80.0, "score was {}", score.score);
    }

    #[test]
    fn test_plan_score_coverage() {
        let bridge = ScoringBridge::new();
        let mut u2 = unit(1, 1, Complexity::Low);
        u2.id = "u2".to_string();
        let units = vec![unit(1, 1, Complexity::Low), u2];

        let mut validations = HashMap::new();
        validations.insert("u1".to_string(), passing_validation("u1", 1));

        let plan_score = bridge.score_plan("plan-1", &units, &validations);
        assert_eq!(plan_score.unit_scores.len(), 2);
        assert_eq!(plan_score.coverage, 50.0);
    }

    #[test]
    fn test_history_filtering() {
        let bridge = ScoringBridge::new();
        bridge.score_unit(&unit(1, 1, Complexity::Low), None);
        let mut other = unit(1, 1, Complexity::Low);
        other.id = "u2".to_string();
        bridge.score_unit(&other, None);

        assert_eq!(bridge.get_score_history(Some("u2"), 10).len(), 1);
        assert_eq!(bridge.get_score_history(None, 10).len(), 2);
        assert_eq!(bridge.get_score_history(None, 1).len(), 1);
    }
}
