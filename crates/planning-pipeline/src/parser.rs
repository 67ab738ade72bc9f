//! Markdown plan parser.
//!
//! Two recognized dialects:
//!
//! Simple steps:
//! ```text
//! # Plan: <goal>
//! ## Context
//! <overview>
//! ## Steps
//! 1. **Step Title**
//!    Description of step
//!    Files: a.py, b.py
//!    Depends: step-1
//!    Tags: backend, api
//! ```
//!
//! Phase based:
//! ```text
//! # <Goal Title> Plan
//! ## Phase 1: Foundation (Week 1-2)
//! ### 1.1 Database Schema
//! Files to create: schema.sql
//! ```
//!
//! Phase based wins when both match. Step ids are `step-N` in document
//! order; the plan id is a deterministic hash of the content, so parsing
//! the same markdown twice yields the same plan.

use crate::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

static PHASE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^## Phase (\d+):\s*(.+?)(?:\s*\([^)]+\))?$").unwrap());
static PHASE_SUBSECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^###\s+(?:\d+\.\d+)?\s*(.+?)$").unwrap());
static NUMBERED_BOLD_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.\s+\*\*(.+?)\*\*").unwrap());
static NUMBERED_STEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.\s+(.+?)$").unwrap());
static NUMBERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\d+\.").unwrap());
static FILE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[`/]([A-Za-z0-9_\-./]+\.[A-Za-z]+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFormat {
    SimpleSteps,
    PhaseBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub files: Vec<String>,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub phase: Option<String>,
    pub parallelizable: bool,
}

impl ParsedStep {
    fn new(id: String, title: String, phase: Option<String>) -> Self {
        let tags = phase
            .as_deref()
            .map(|p| vec![p.to_lowercase().replace(' ', "-")])
            .unwrap_or_default();
        Self {
            id,
            title,
            description: String::new(),
            files: Vec::new(),
            dependencies: Vec::new(),
            tags,
            acceptance_criteria: Vec::new(),
            phase,
            parallelizable: true,
        }
    }
}

/// Immutable after parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPlan {
    pub plan_id: String,
    pub title: String,
    pub overview: String,
    pub format_type: PlanFormat,
    pub steps: Vec<ParsedStep>,
}

#[derive(Debug, Default)]
pub struct PlanParser {
    plans_parsed: std::sync::atomic::AtomicU64,
    parse_errors: std::sync::atomic::AtomicU64,
}

enum Section {
    None,
    Context,
    Steps,
    Phase,
    Other,
}

impl PlanParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the dialect from structural signals. Phase based wins when
    /// both match.
    pub fn detect_format(&self, markdown: &str) -> Result<PlanFormat, PipelineError> {
        let has_phases = markdown
            .lines()
            .any(|line| PHASE_HEADER.is_match(line));
        if has_phases {
            return Ok(PlanFormat::PhaseBased);
        }

        let has_plan_header = markdown.lines().any(|line| line.starts_with("# Plan:"));
        let has_steps_section = markdown
            .lines()
            .any(|line| line.starts_with("## Steps") || line.starts_with("## Implementation"))
            && NUMBERED_ITEM.is_match(markdown);
        if has_plan_header || has_steps_section {
            return Ok(PlanFormat::SimpleSteps);
        }

        Err(PipelineError::Parse(
            "No recognizable plan format (expected '# Plan:' steps or '## Phase N:' sections)"
                .to_string(),
        ))
    }

    pub fn parse(&self, markdown: &str) -> Result<ParsedPlan, PipelineError> {
        let result = self.parse_inner(markdown);
        match &result {
            Ok(plan) => {
                self.plans_parsed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(
                    plan_id = %plan.plan_id,
                    steps = plan.steps.len(),
                    format = ?plan.format_type,
                    "Parsed plan '{}'", plan.title
                );
            }
            Err(_) => {
                self.parse_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        result
    }

    fn parse_inner(&self, markdown: &str) -> Result<ParsedPlan, PipelineError> {
        if markdown.trim().is_empty() {
            return Err(PipelineError::Parse("Empty plan body".to_string()));
        }

        let format_type = self.detect_format(markdown)?;

        let mut title = String::new();
        let mut overview = String::new();
        let mut steps: Vec<ParsedStep> = Vec::new();
        let mut section = Section::None;
        let mut current_phase: Option<String> = None;
        let mut current_step: Option<ParsedStep> = None;
        let mut description_lines: Vec<String> = Vec::new();
        let mut step_counter = 0usize;

        let mut finish_step =
            |step: Option<ParsedStep>, lines: &mut Vec<String>, steps: &mut Vec<ParsedStep>| {
                if let Some(mut step) = step {
                    step.description = lines.join(" ").trim().to_string();
                    steps.push(step);
                    lines.clear();
                }
            };

        for line in markdown.lines() {
            // Title headers.
            if line.starts_with("# Plan:") {
                title = line.trim_start_matches("# Plan:").trim().to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("# ") {
                if title.is_empty() {
                    title = rest
                        .trim()
                        .trim_end_matches(" Implementation Plan")
                        .trim_end_matches(" Plan")
                        .to_string();
                }
                continue;
            }

            // Phase headers.
            if let Some(captures) = PHASE_HEADER.captures(line) {
                finish_step(current_step.take(), &mut description_lines, &mut steps);
                section = Section::Phase;
                current_phase = Some(captures[2].trim().to_string());
                continue;
            }

            // Subsections inside a phase start a new step.
            if matches!(section, Section::Phase) && line.starts_with("### ") {
                finish_step(current_step.take(), &mut description_lines, &mut steps);
                if let Some(captures) = PHASE_SUBSECTION.captures(line) {
                    step_counter += 1;
                    current_step = Some(ParsedStep::new(
                        format!("step-{}", step_counter),
                        captures[1].trim().to_string(),
                        current_phase.clone(),
                    ));
                }
                continue;
            }

            // Section headers for the simple dialect.
            if line.starts_with("## Context") || line.starts_with("## Executive Summary") {
                section = Section::Context;
                continue;
            }
            if line.starts_with("## Steps") || line.starts_with("## Implementation") {
                section = Section::Steps;
                continue;
            }
            if line.starts_with("## ") {
                let lower = line.to_lowercase();
                section = if lower.contains("summary") || lower.contains("overview") {
                    Section::Context
                } else {
                    Section::Other
                };
                continue;
            }

            match section {
                Section::Steps => {
                    let step_match = NUMBERED_BOLD_STEP
                        .captures(line)
                        .or_else(|| NUMBERED_STEP.captures(line));
                    if let Some(captures) = step_match {
                        finish_step(current_step.take(), &mut description_lines, &mut steps);
                        step_counter += 1;
                        current_step = Some(ParsedStep::new(
                            format!("step-{}", step_counter),
                            captures[2].trim().to_string(),
                            None,
                        ));
                    } else if let Some(step) = current_step.as_mut() {
                        Self::parse_step_metadata(line, step, &mut description_lines);
                    }
                }
                Section::Phase => {
                    if let Some(step) = current_step.as_mut() {
                        Self::parse_step_metadata(line, step, &mut description_lines);
                    }
                }
                Section::Context => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty()
                        && !trimmed.starts_with('#')
                        && !trimmed.starts_with("```")
                    {
                        overview.push_str(trimmed);
                        overview.push(' ');
                    }
                }
                _ => {}
            }
        }

        finish_step(current_step.take(), &mut description_lines, &mut steps);

        if title.is_empty() {
            return Err(PipelineError::Parse("No recognizable title line".to_string()));
        }
        if steps.is_empty() {
            return Err(PipelineError::Parse("No steps discovered".to_string()));
        }

        for step in &mut steps {
            step.parallelizable = step.dependencies.is_empty();
            if step.files.is_empty() {
                step.files = Self::infer_files(&step.description);
            }
        }

        Ok(ParsedPlan {
            plan_id: Self::plan_id(&title, markdown),
            title,
            overview: overview.trim().to_string(),
            format_type,
            steps,
        })
    }

    /// Per-step metadata recognized on its own line, case-sensitive.
    fn parse_step_metadata(line: &str, step: &mut ParsedStep, description: &mut Vec<String>) {
        let stripped = line.trim();

        if stripped.is_empty() || stripped.starts_with('#') || stripped.starts_with("```") {
            return;
        }

        if let Some(rest) = stripped
            .strip_prefix("Files to create:")
            .or_else(|| stripped.strip_prefix("Files:"))
        {
            step.files
                .extend(rest.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from));
        } else if let Some(rest) = stripped
            .strip_prefix("Dependencies:")
            .or_else(|| stripped.strip_prefix("Depends:"))
        {
            step.dependencies
                .extend(rest.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from));
        } else if let Some(rest) = stripped.strip_prefix("Tags:") {
            step.tags.extend(
                rest.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        } else if let Some(rest) = stripped.strip_prefix("Acceptance:") {
            step.acceptance_criteria
                .extend(rest.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from));
        } else if stripped.starts_with("Create:") && stripped.contains('/') {
            let path = stripped
                .trim_start_matches("Create:")
                .trim()
                .trim_matches('`')
                .to_string();
            step.files.push(path);
        } else if let Some(rest) = stripped.strip_prefix("- ").or_else(|| stripped.strip_prefix("* "))
        {
            description.push(rest.to_string());
        } else if !stripped.starts_with('|') && !stripped.starts_with("---") {
            description.push(stripped.to_string());
        }
    }

    /// Infer file targets from file-like tokens in the description.
    fn infer_files(description: &str) -> Vec<String> {
        FILE_TOKEN
            .captures_iter(description)
            .map(|c| c[1].to_string())
            .filter(|f| f.contains('.') && !f.starts_with('.'))
            .collect()
    }

    /// 12-hex-digit deterministic plan id. Seeded from the title and the
    /// head of the document so reparsing is idempotent.
    fn plan_id(title: &str, markdown: &str) -> String {
        let head: String = markdown.chars().take(100).collect();
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(head.as_bytes());
        let digest = hasher.finalize();
        let hex = digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        debug!(plan_id = %&hex[..12], "Derived plan id");
        hex[..12].to_string()
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let parsed = self.plans_parsed.load(std::sync::atomic::Ordering::Relaxed);
        let errors = self.parse_errors.load(std::sync::atomic::Ordering::Relaxed);
        serde_json::json!({
            "plans_parsed": parsed,
            "parse_errors": errors,
            "success_rate": if parsed + errors > 0 {
                parsed as f64 / (parsed + errors) as f64
            } else {
                0.0
            },
        })
    }
}
