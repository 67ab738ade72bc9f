//! Decomposes parsed plans into atomic units.
//!
//! Each step becomes one unit with generated acceptance criteria, a
//! complexity estimate, a time estimate, and a compensation action.
//! Dependency ids that do not resolve inside the batch are dropped here,
//! not at runtime.

use crate::parser::{ParsedPlan, ParsedStep};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

pub const MANUAL_VERIFICATION: &str = "Manual verification required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Single acceptance criterion for an atomic unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub description: String,
    pub validation_command: String,
    pub expected_result: String,
    pub timeout_seconds: u64,
}

impl Criterion {
    fn new(id: String, description: String, validation_command: String) -> Self {
        Self {
            id,
            description,
            validation_command,
            expected_result: "success".to_string(),
            timeout_seconds: 60,
        }
    }

    /// Whether this is the manual-verification sentinel the validator skips.
    pub fn is_manual(&self) -> bool {
        self.validation_command.contains(MANUAL_VERIFICATION)
    }
}

/// Smallest independently validatable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicUnit {
    pub id: String,
    pub title: String,
    pub description: String,
    pub files: Vec<String>,
    pub dependencies: Vec<String>,
    pub acceptance_criteria: Vec<Criterion>,
    pub phase: Option<String>,
    pub complexity: Complexity,
    pub estimated_minutes: u32,
    pub compensation_action: String,
}

/// Decomposes a [`ParsedPlan`] into a batch of [`AtomicUnit`]s.
#[derive(Debug, Default)]
pub struct SpecDecomposer {
    units: Vec<AtomicUnit>,
}

impl SpecDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decompose(&mut self, plan: &ParsedPlan) -> Vec<AtomicUnit> {
        self.units = plan.steps.iter().map(Self::step_to_unit).collect();
        self.resolve_dependencies();
        info!(
            plan_id = %plan.plan_id,
            units = self.units.len(),
            "Decomposed plan into atomic units"
        );
        self.units.clone()
    }

    pub fn units(&self) -> &[AtomicUnit] {
        &self.units
    }

    pub fn get_unit(&self, unit_id: &str) -> Option<&AtomicUnit> {
        self.units.iter().find(|u| u.id == unit_id)
    }

    fn step_to_unit(step: &ParsedStep) -> AtomicUnit {
        let complexity = Self::estimate_complexity(step);
        AtomicUnit {
            id: step.id.clone(),
            title: step.title.clone(),
            description: step.description.clone(),
            files: step.files.clone(),
            dependencies: step.dependencies.clone(),
            acceptance_criteria: Self::generate_criteria(step),
            phase: step.phase.clone(),
            complexity,
            estimated_minutes: Self::estimate_minutes(complexity),
            compensation_action: Self::compensation_for(step),
        }
    }

    /// Criteria generation order: explicit criteria, then one per file
    /// (capped at 3), then the manual-verification sentinel.
    fn generate_criteria(step: &ParsedStep) -> Vec<Criterion> {
        let mut criteria: Vec<Criterion> = step
            .acceptance_criteria
            .iter()
            .enumerate()
            .map(|(i, text)| {
                Criterion::new(
                    format!("{}-criterion-{}", step.id, i + 1),
                    text.clone(),
                    Self::infer_command(text, step),
                )
            })
            .collect();

        if criteria.is_empty() && !step.files.is_empty() {
            for file in step.files.iter().take(3) {
                let slug = file.replace(['/', '.'], "-");
                let command = if file.ends_with(".py") {
                    format!("python -m py_compile {}", file)
                } else {
                    format!("test -f {}", file)
                };
                criteria.push(Criterion::new(
                    format!("{}-file-{}", step.id, slug),
                    format!("File {} exists and is valid", file),
                    command,
                ));
            }
        }

        if criteria.is_empty() {
            criteria.push(Criterion::new(
                format!("{}-default", step.id),
                "Implementation matches step description".to_string(),
                format!("echo '{}'", MANUAL_VERIFICATION),
            ));
        }

        criteria
    }

    fn infer_command(criterion: &str, step: &ParsedStep) -> String {
        let lower = criterion.to_lowercase();
        if lower.contains("exists") && !step.files.is_empty() {
            format!("test -f {}", step.files[0])
        } else if lower.contains("test") {
            "pytest --collect-only".to_string()
        } else if lower.contains("lint") {
            "python -m py_compile".to_string()
        } else {
            format!("echo '{}'", MANUAL_VERIFICATION)
        }
    }

    fn estimate_complexity(step: &ParsedStep) -> Complexity {
        let files = step.files.len();
        let description = step.description.len();
        let dependencies = step.dependencies.len();

        if files > 3 || description > 500 || dependencies > 2 {
            Complexity::High
        } else if files > 1 || description > 200 || dependencies > 0 {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }

    fn estimate_minutes(complexity: Complexity) -> u32 {
        match complexity {
            Complexity::Low => 10,
            Complexity::Medium => 20,
            Complexity::High => 30,
        }
    }

    fn compensation_for(step: &ParsedStep) -> String {
        if step.files.is_empty() {
            "git checkout -- .".to_string()
        } else {
            format!("git checkout -- {}", step.files.join(" "))
        }
    }

    /// Drop dependency ids that do not name a unit in this batch.
    fn resolve_dependencies(&mut self) {
        let ids: HashSet<String> = self.units.iter().map(|u| u.id.clone()).collect();
        for unit in &mut self.units {
            unit.dependencies.retain(|d| ids.contains(d));
        }
    }

    /// Units in topological order. Cycles are broken by processing the
    /// first unvisited unit in input order; this is logged, not fatal.
    pub fn execution_order(&self) -> Vec<AtomicUnit> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<AtomicUnit> = Vec::new();

        fn visit(
            unit: &AtomicUnit,
            units: &[AtomicUnit],
            visited: &mut HashSet<String>,
            order: &mut Vec<AtomicUnit>,
        ) {
            if visited.contains(&unit.id) {
                return;
            }
            visited.insert(unit.id.clone());

            for dep_id in &unit.dependencies {
                if let Some(dep) = units.iter().find(|u| &u.id == dep_id) {
                    visit(dep, units, visited, order);
                }
            }
            order.push(unit.clone());
        }

        for unit in &self.units {
            if !visited.contains(&unit.id) {
                if unit
                    .dependencies
                    .iter()
                    .any(|d| !visited.contains(d))
                    && self.has_cycle_through(&unit.id)
                {
                    warn!(unit_id = %unit.id, "Dependency cycle detected, breaking at unit");
                }
                visit(unit, &self.units, &mut visited, &mut order);
            }
        }

        order
    }

    fn has_cycle_through(&self, start: &str) -> bool {
        let mut stack = vec![start.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if let Some(unit) = self.get_unit(&id) {
                for dep in &unit.dependencies {
                    if dep == start {
                        return true;
                    }
                    if seen.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{PlanFormat, PlanParser};

    fn step(id: &str, files: &[&str], deps: &[&str]) -> ParsedStep {
        ParsedStep {
            id: id.to_string(),
            title: format!("Step {}", id),
            description: "do something".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            tags: vec![],
            acceptance_criteria: vec![],
            phase: None,
            parallelizable: deps.is_empty(),
        }
    }

    fn plan(steps: Vec<ParsedStep>) -> ParsedPlan {
        ParsedPlan {
            plan_id: "abc123def456".to_string(),
            title: "Test".to_string(),
            overview: String::new(),
            format_type: PlanFormat::SimpleSteps,
            steps,
        }
    }

    #[test]
    fn test_every_dependency_resolves_in_batch() {
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&plan(vec![
            step("step-1", &[], &[]),
            step("step-2", &[], &["step-1", "step-99"]),
        ]));

        // The unresolved id is dropped at decomposition.
        assert_eq!(units[1].dependencies, vec!["step-1"]);
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        for unit in &units {
            for dep in &unit.dependencies {
                assert!(ids.contains(&dep.as_str()));
            }
        }
    }

    #[test]
    fn test_criteria_from_files_capped_at_three() {
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&plan(vec![step(
            "step-1",
            &["a.py", "b.txt", "c.txt", "d.txt"],
            &[],
        )]));

        let criteria = &units[0].acceptance_criteria;
        assert_eq!(criteria.len(), 3);
        assert_eq!(criteria[0].validation_command, "python -m py_compile a.py");
        assert_eq!(criteria[1].validation_command, "test -f b.txt");
    }

    #[test]
    fn test_manual_sentinel_when_nothing_to_check() {
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&plan(vec![step("step-1", &[], &[])]));

        let criteria = &units[0].acceptance_criteria;
        assert_eq!(criteria.len(), 1);
        assert!(criteria[0].is_manual());
    }

    #[test]
    fn test_explicit_criteria_take_precedence() {
        let mut s = step("step-1", &["a.py"], &[]);
        s.acceptance_criteria = vec!["File a.py exists".to_string()];
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&plan(vec![s]));

        let criteria = &units[0].acceptance_criteria;
        assert_eq!(criteria.len(), 1);
        assert_eq!(criteria[0].validation_command, "test -f a.py");
    }

    #[test]
    fn test_complexity_thresholds() {
        let mut decomposer = SpecDecomposer::new();

        let mut long_desc = step("step-1", &[], &[]);
        long_desc.description = "x".repeat(501);
        let units = decomposer.decompose(&plan(vec![
            step("step-2", &["a", "b", "c", "d"], &[]),
            long_desc,
            step("step-3", &["a", "b"], &[]),
            step("step-4", &[], &[]),
        ]));

        assert_eq!(units[0].complexity, Complexity::High);
        assert_eq!(units[0].estimated_minutes, 30);
        assert_eq!(units[1].complexity, Complexity::High);
        assert_eq!(units[2].complexity, Complexity::Medium);
        assert_eq!(units[2].estimated_minutes, 20);
        assert_eq!(units[3].complexity, Complexity::Low);
        assert_eq!(units[3].estimated_minutes, 10);
    }

    #[test]
    fn test_compensation_action_lists_files() {
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&plan(vec![
            step("step-1", &["a.py", "b.py"], &[]),
            step("step-2", &[], &[]),
        ]));

        assert_eq!(units[0].compensation_action, "git checkout -- a.py b.py");
        assert_eq!(units[1].compensation_action, "git checkout -- .");
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let mut decomposer = SpecDecomposer::new();
        decomposer.decompose(&plan(vec![
            step("step-1", &[], &["step-2"]),
            step("step-2", &[], &[]),
            step("step-3", &[], &["step-1"]),
        ]));

        let order: Vec<String> = decomposer
            .execution_order()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(order, vec!["step-2", "step-1", "step-3"]);
    }

    #[test]
    fn test_cycle_is_broken_and_terminates() {
        let mut decomposer = SpecDecomposer::new();
        decomposer.decompose(&plan(vec![
            step("step-1", &[], &["step-2"]),
            step("step-2", &[], &["step-1"]),
        ]));

        let order = decomposer.execution_order();
        assert_eq!(order.len(), 2);
        let ids: HashSet<String> = order.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_decompose_round_trips_from_parser() {
        let parser = PlanParser::new();
        let parsed = parser
            .parse("# Plan: demo\n\n## Steps\n1. **Only step**\n   Files: demo.py\n")
            .unwrap();
        let mut decomposer = SpecDecomposer::new();
        let units = decomposer.decompose(&parsed);

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "step-1");
        assert_eq!(units[0].files, vec!["demo.py"]);
    }
}
