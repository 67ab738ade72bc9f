//! Intelligent model routing for planning tasks.
//!
//! Routes tasks to models by complexity and category:
//! - Simple tasks -> local codellama
//! - Moderate tasks -> local mistral
//! - Complex tasks -> claude-3-sonnet
//! - Critical tasks -> claude-3-opus
//!
//! Escalation walks a fixed chain from the strategy-selected model upward
//! until a quality threshold is met or the chain is exhausted. The built-in
//! quality estimate is a provisional heuristic; an external scorer, when
//! wired, replaces it (never both).

use crate::bridges::model::{GeneratedPlan, ModelPort, ModelProvider};
use crate::bridges::scoring::ScoringBridge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Validation,
    Generation,
    Analysis,
    Decomposition,
    Planning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Cost,
    Quality,
    Latency,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: String,
    pub provider: ModelProvider,
    pub complexity: ComplexityLevel,
    pub category: TaskCategory,
    pub confidence: f64,
    pub reason: String,
    pub estimated_cost: f64,
    pub estimated_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationResult {
    pub plan: GeneratedPlan,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub attempts: u32,
    pub models_tried: Vec<String>,
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_strategy: RoutingStrategy,
    pub quality_threshold: f64,
    pub prefer_local: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::Balanced,
            quality_threshold: 0.7,
            prefer_local: true,
        }
    }
}

struct ModelSpec {
    name: &'static str,
    provider: ModelProvider,
    complexity: &'static [ComplexityLevel],
    categories: &'static [TaskCategory],
    cost_factor: f64,
    latency_ms: u64,
}

use ComplexityLevel::*;
use TaskCategory::*;

const MODEL_TABLE: &[ModelSpec] = &[
    ModelSpec {
        name: "codellama",
        provider: ModelProvider::Ollama,
        complexity: &[Simple],
        categories: &[Validation, Generation],
        cost_factor: 0.0,
        latency_ms: 500,
    },
    ModelSpec {
        name: "mistral",
        provider: ModelProvider::Ollama,
        complexity: &[Simple, Moderate],
        categories: &[Validation, Generation, Analysis],
        cost_factor: 0.0,
        latency_ms: 800,
    },
    ModelSpec {
        name: "llama2",
        provider: ModelProvider::Ollama,
        complexity: &[Simple, Moderate],
        categories: &[Generation, Analysis],
        cost_factor: 0.0,
        latency_ms: 1000,
    },
    ModelSpec {
        name: "claude-3-haiku",
        provider: ModelProvider::Anthropic,
        complexity: &[Moderate, Complex],
        categories: &[Validation, Generation, Analysis],
        cost_factor: 0.25,
        latency_ms: 300,
    },
    ModelSpec {
        name: "claude-3-sonnet",
        provider: ModelProvider::Anthropic,
        complexity: &[Moderate, Complex, Critical],
        categories: &[Generation, Analysis, Decomposition, Planning],
        cost_factor: 1.0,
        latency_ms: 500,
    },
    ModelSpec {
        name: "claude-3-opus",
        provider: ModelProvider::Anthropic,
        complexity: &[Critical],
        categories: &[Decomposition, Planning],
        cost_factor: 5.0,
        latency_ms: 1500,
    },
];

/// Escalation chain, cheapest to strongest.
const ESCALATION_CHAIN: &[(ModelProvider, &str)] = &[
    (ModelProvider::Ollama, "mistral"),
    (ModelProvider::Anthropic, "claude-3-haiku"),
    (ModelProvider::Anthropic, "claude-3-sonnet"),
    (ModelProvider::Anthropic, "claude-3-opus"),
];

fn model_spec(provider: ModelProvider, name: &str) -> Option<&'static ModelSpec> {
    MODEL_TABLE
        .iter()
        .find(|m| m.provider == provider && m.name == name)
}

const COMPLEXITY_KEYWORDS: &[(ComplexityLevel, &[&str])] = &[
    (
        Simple,
        &["check", "validate", "verify", "simple", "basic", "syntax", "format", "lint", "exists", "file"],
    ),
    (
        Moderate,
        &["generate", "create", "implement", "add", "modify", "update", "refactor", "extract", "transform"],
    ),
    (
        Complex,
        &["design", "architect", "optimize", "integrate", "migrate", "analyze", "review", "novel", "complex"],
    ),
    (
        Critical,
        &["critical", "security", "production", "breaking", "migration", "data", "schema", "api", "public"],
    ),
];

const CATEGORY_KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (Validation, &["validate", "check", "verify", "test", "lint"]),
    (Generation, &["generate", "create", "write", "implement", "add"]),
    (Analysis, &["analyze", "review", "examine", "inspect", "audit"]),
    (Decomposition, &["decompose", "break", "split", "extract", "separate"]),
    (Planning, &["plan", "design", "architect", "strategy", "approach"]),
];

pub struct ModelRouter {
    port: Arc<dyn ModelPort>,
    config: RouterConfig,
    scorer: Option<Arc<ScoringBridge>>,
    history: Mutex<Vec<RoutingDecision>>,
    escalation_count: AtomicU64,
    total_cost: Mutex<f64>,
}

impl ModelRouter {
    pub fn new(port: Arc<dyn ModelPort>, config: RouterConfig) -> Self {
        Self {
            port,
            config,
            scorer: None,
            history: Mutex::new(Vec::new()),
            escalation_count: AtomicU64::new(0),
            total_cost: Mutex::new(0.0),
        }
    }

    /// Wire an external scorer. When present, escalation consults it
    /// instead of the built-in heuristic.
    pub fn with_scorer(mut self, scorer: Arc<ScoringBridge>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Keyword-scored complexity with ties broken toward simple. Long
    /// descriptions and many file tokens bias the estimate upward.
    pub fn analyze_complexity(&self, task: &str) -> ComplexityLevel {
        let lower = task.to_lowercase();
        let mut scores = [(Simple, 0i32), (Moderate, 0), (Complex, 0), (Critical, 0)];

        for (level, keywords) in COMPLEXITY_KEYWORDS {
            for keyword in *keywords {
                if lower.contains(keyword) {
                    for (l, score) in scores.iter_mut() {
                        if l == level {
                            *score += 1;
                        }
                    }
                }
            }
        }

        if task.len() > 500 {
            scores[2].1 += 2;
        } else if task.len() > 200 {
            scores[1].1 += 1;
        }

        let file_tokens = count_file_tokens(&lower);
        if file_tokens > 5 {
            scores[2].1 += 2;
        } else if file_tokens > 2 {
            scores[1].1 += 1;
        }

        let mut best = Simple;
        let mut best_score = 0;
        for (level, score) in scores {
            if score > best_score {
                best_score = score;
                best = level;
            }
        }
        best
    }

    /// Keyword-scored category; generation by default.
    pub fn analyze_category(&self, task: &str) -> TaskCategory {
        let lower = task.to_lowercase();
        let mut best = Generation;
        let mut best_score = 0;

        for (category, keywords) in CATEGORY_KEYWORDS {
            let score = keywords.iter().filter(|k| lower.contains(**k)).count();
            if score > best_score {
                best_score = score;
                best = *category;
            }
        }
        best
    }

    pub fn route(&self, task: &str, strategy: Option<RoutingStrategy>) -> RoutingDecision {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let complexity = self.analyze_complexity(task);
        let category = self.analyze_category(task);

        debug!(?complexity, ?category, ?strategy, "Routing task");

        let decision = match strategy {
            RoutingStrategy::Cost => self.route_for_cost(complexity, category),
            RoutingStrategy::Quality => self.route_for_quality(complexity, category),
            RoutingStrategy::Latency => self.route_for_latency(complexity, category),
            RoutingStrategy::Balanced => self.route_balanced(complexity, category),
        };

        info!(
            model = %decision.model,
            provider = ?decision.provider,
            "{}", decision.reason
        );
        self.history.lock().push(decision.clone());
        decision
    }

    fn decision(
        spec: &ModelSpec,
        complexity: ComplexityLevel,
        category: TaskCategory,
        confidence: f64,
        reason: String,
    ) -> RoutingDecision {
        RoutingDecision {
            model: spec.name.to_string(),
            provider: spec.provider,
            complexity,
            category,
            confidence,
            reason,
            estimated_cost: spec.cost_factor,
            estimated_latency_ms: spec.latency_ms,
        }
    }

    /// First matching local model; cheapest cloud model as fallback.
    fn route_for_cost(&self, complexity: ComplexityLevel, category: TaskCategory) -> RoutingDecision {
        for spec in MODEL_TABLE.iter().filter(|m| m.provider == ModelProvider::Ollama) {
            if spec.complexity.contains(&complexity) && spec.categories.contains(&category) {
                return Self::decision(
                    spec,
                    complexity,
                    category,
                    0.8,
                    format!("Cost-optimized: using local {}", spec.name),
                );
            }
        }
        let haiku = model_spec(ModelProvider::Anthropic, "claude-3-haiku").unwrap();
        Self::decision(
            haiku,
            complexity,
            category,
            0.7,
            "Cost-optimized fallback: claude-3-haiku".to_string(),
        )
    }

    fn route_for_quality(
        &self,
        complexity: ComplexityLevel,
        category: TaskCategory,
    ) -> RoutingDecision {
        let name = match complexity {
            Critical => "claude-3-opus",
            Complex => "claude-3-sonnet",
            _ => "claude-3-haiku",
        };
        let spec = model_spec(ModelProvider::Anthropic, name).unwrap();
        Self::decision(
            spec,
            complexity,
            category,
            0.9,
            format!("Quality-optimized: using {}", name),
        )
    }

    fn route_for_latency(
        &self,
        complexity: ComplexityLevel,
        category: TaskCategory,
    ) -> RoutingDecision {
        if complexity == Simple {
            let spec = model_spec(ModelProvider::Ollama, "codellama").unwrap();
            return Self::decision(
                spec,
                complexity,
                category,
                0.85,
                "Latency-optimized: using local codellama".to_string(),
            );
        }
        let spec = model_spec(ModelProvider::Anthropic, "claude-3-haiku").unwrap();
        Self::decision(
            spec,
            complexity,
            category,
            0.85,
            "Latency-optimized: using claude-3-haiku".to_string(),
        )
    }

    fn route_balanced(
        &self,
        complexity: ComplexityLevel,
        category: TaskCategory,
    ) -> RoutingDecision {
        if complexity == Simple && self.config.prefer_local {
            for spec in MODEL_TABLE.iter().filter(|m| m.provider == ModelProvider::Ollama) {
                if spec.categories.contains(&category) {
                    return Self::decision(
                        spec,
                        complexity,
                        category,
                        0.8,
                        format!("Balanced: simple task -> local {}", spec.name),
                    );
                }
            }
        }

        match complexity {
            Moderate => {
                if self.config.prefer_local {
                    let spec = model_spec(ModelProvider::Ollama, "mistral").unwrap();
                    Self::decision(
                        spec,
                        complexity,
                        category,
                        0.75,
                        "Balanced: moderate task -> mistral".to_string(),
                    )
                } else {
                    let spec = model_spec(ModelProvider::Anthropic, "claude-3-haiku").unwrap();
                    Self::decision(
                        spec,
                        complexity,
                        category,
                        0.8,
                        "Balanced: moderate task -> claude-3-haiku".to_string(),
                    )
                }
            }
            Complex => {
                let spec = model_spec(ModelProvider::Anthropic, "claude-3-sonnet").unwrap();
                Self::decision(
                    spec,
                    complexity,
                    category,
                    0.85,
                    "Balanced: complex task -> claude-3-sonnet".to_string(),
                )
            }
            _ => {
                let spec = model_spec(ModelProvider::Anthropic, "claude-3-opus").unwrap();
                Self::decision(
                    spec,
                    complexity,
                    category,
                    0.9,
                    "Balanced: critical task -> claude-3-opus".to_string(),
                )
            }
        }
    }

    /// Generate with quality-based escalation. Starts at the
    /// strategy-selected model and walks the chain upward until the
    /// quality threshold is met or the chain is exhausted.
    pub async fn generate_with_escalation(
        &self,
        task: &str,
        min_quality: f64,
        max_escalations: u32,
        context: Option<serde_json::Value>,
    ) -> EscalationResult {
        let decision = self.route(task, None);

        let start = ESCALATION_CHAIN
            .iter()
            .position(|(provider, model)| {
                *provider == decision.provider && *model == decision.model
            })
            .unwrap_or(0);

        let mut result = EscalationResult {
            plan: GeneratedPlan::empty(),
            escalated: false,
            escalation_reason: None,
            attempts: 0,
            models_tried: Vec::new(),
            total_cost: 0.0,
        };

        for (attempt, (provider, model)) in ESCALATION_CHAIN[start..].iter().enumerate() {
            if attempt as u32 > max_escalations {
                break;
            }

            result.models_tried.push(model.to_string());
            result.attempts = attempt as u32 + 1;

            info!(model, attempt = attempt + 1, "Attempting generation");
            let plan = self
                .port
                .generate_plan(task, context.clone(), model, *provider)
                .await;

            if let Some(spec) = model_spec(*provider, model) {
                result.total_cost += spec.cost_factor;
                *self.total_cost.lock() += spec.cost_factor;
            }

            let quality = match &self.scorer {
                Some(scorer) => scorer.estimate_plan_quality(&plan.content),
                None => estimate_quality(&plan.content),
            };
            result.plan = plan;

            if quality >= min_quality {
                info!(model, quality, "Quality threshold met");
                return result;
            }

            result.escalated = true;
            result.escalation_reason =
                Some(format!("Quality {:.2} < threshold {:.2}", quality, min_quality));
            self.escalation_count.fetch_add(1, Ordering::Relaxed);
            warn!(model, quality, "Escalating to next model in chain");
        }

        result
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let history = self.history.lock();
        let total = history.len();

        let mut by_provider: std::collections::HashMap<String, usize> = Default::default();
        let mut by_complexity: std::collections::HashMap<String, usize> = Default::default();
        for decision in history.iter() {
            let provider = format!("{:?}", decision.provider).to_lowercase();
            *by_provider.entry(provider).or_insert(0) += 1;
            let complexity = format!("{:?}", decision.complexity).to_lowercase();
            *by_complexity.entry(complexity).or_insert(0) += 1;
        }

        let local = by_provider.get("ollama").copied().unwrap_or(0);
        serde_json::json!({
            "total_routings": total,
            "by_provider": by_provider,
            "by_complexity": by_complexity,
            "escalation_count": self.escalation_count.load(Ordering::Relaxed),
            "total_cost": *self.total_cost.lock(),
            "local_percentage": if total > 0 { local as f64 / total as f64 * 100.0 } else { 0.0 },
            "prefer_local": self.config.prefer_local,
        })
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

fn count_file_tokens(task: &str) -> usize {
    static EXT: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\.(py|js|ts|java|go|rs|cpp)\b").unwrap());
    EXT.find_iter(task).count()
}

/// Provisional quality heuristic over generated plan text: length buckets,
/// section headers, criteria keywords, and file-like tokens, capped at 1.0.
pub fn estimate_quality(content: &str) -> f64 {
    let mut quality: f64 = 0.5;
    if content.len() > 200 {
        quality += 0.1;
    }
    if content.len() > 500 {
        quality += 0.1;
    }
    if content.contains("##") {
        quality += 0.1;
    }
    if content.contains("###") {
        quality += 0.05;
    }
    let lower = content.to_lowercase();
    if lower.contains("acceptance") || lower.contains("criteria") {
        quality += 0.1;
    }
    if lower.contains("file") || content.contains(".py") || content.contains(".js") {
        quality += 0.1;
    }
    quality.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::model::OfflineModelBridge;

    fn router(config: RouterConfig) -> ModelRouter {
        ModelRouter::new(Arc::new(OfflineModelBridge::new()), config)
    }

    #[test]
    fn test_complexity_ties_break_toward_simple() {
        let r = router(RouterConfig::default());
        // No keywords at all: everything scores zero.
        assert_eq!(r.analyze_complexity("do the thing"), ComplexityLevel::Simple);
    }

    #[test]
    fn test_complexity_keyword_scoring() {
        let r = router(RouterConfig::default());
        assert_eq!(
            r.analyze_complexity("validate the file syntax"),
            ComplexityLevel::Simple
        );
        assert_eq!(
            r.analyze_complexity("implement and refactor the handler, update callers"),
            ComplexityLevel::Moderate
        );
        assert_eq!(
            r.analyze_complexity("design and architect a novel integration"),
            ComplexityLevel::Complex
        );
    }

    #[test]
    fn test_long_text_biases_complex() {
        let r = router(RouterConfig::default());
        let long = "word ".repeat(120);
        assert_eq!(r.analyze_complexity(&long), ComplexityLevel::Complex);
    }

    #[test]
    fn test_category_default_is_generation() {
        let r = router(RouterConfig::default());
        assert_eq!(r.analyze_category("hmm"), TaskCategory::Generation);
        assert_eq!(
            r.analyze_category("audit and inspect the module"),
            TaskCategory::Analysis
        );
        assert_eq!(
            r.analyze_category("plan the migration strategy"),
            TaskCategory::Planning
        );
    }

    #[test]
    fn test_cost_strategy_prefers_local() {
        let r = router(RouterConfig::default());
        let decision = r.route("validate the file", Some(RoutingStrategy::Cost));
        assert_eq!(decision.provider, ModelProvider::Ollama);
        assert_eq!(decision.estimated_cost, 0.0);
    }

    #[test]
    fn test_quality_strategy_maps_complexity_to_cloud() {
        let r = router(RouterConfig::default());
        let decision = r.route(
            "critical production schema migration with breaking api changes",
            Some(RoutingStrategy::Quality),
        );
        assert_eq!(decision.model, "claude-3-opus");

        let decision = r.route("check a file", Some(RoutingStrategy::Quality));
        assert_eq!(decision.model, "claude-3-haiku");
    }

    #[test]
    fn test_latency_strategy() {
        let r = router(RouterConfig::default());
        let decision = r.route("check file exists", Some(RoutingStrategy::Latency));
        assert_eq!(decision.model, "codellama");

        let decision = r.route(
            "design a novel architecture review",
            Some(RoutingStrategy::Latency),
        );
        assert_eq!(decision.model, "claude-3-haiku");
    }

    #[test]
    fn test_balanced_strategy_tiers() {
        let r = router(RouterConfig::default());
        assert_eq!(
            r.route("check syntax", Some(RoutingStrategy::Balanced)).provider,
            ModelProvider::Ollama
        );
        assert_eq!(
            r.route("implement the new handler", Some(RoutingStrategy::Balanced))
                .model,
            "mistral"
        );
        assert_eq!(
            r.route("architect a novel design", Some(RoutingStrategy::Balanced))
                .model,
            "claude-3-sonnet"
        );
    }

    #[tokio::test]
    async fn test_escalation_stops_when_threshold_met() {
        let r = router(RouterConfig::default());
        // The offline bridge emits a structured plan; the heuristic scores
        // it well above 0.5.
        let result = r
            .generate_with_escalation("implement the widget", 0.5, 2, None)
            .await;
        assert!(!result.escalated);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.models_tried, vec!["mistral"]);
    }

    #[tokio::test]
    async fn test_escalation_walks_chain_when_threshold_unreachable() {
        let r = router(RouterConfig::default());
        // Quality is capped at 1.0, so a threshold above it forces a full
        // walk of the remaining chain.
        let result = r
            .generate_with_escalation("implement the widget", 1.5, 2, None)
            .await;
        assert!(result.escalated);
        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.models_tried,
            vec!["mistral", "claude-3-haiku", "claude-3-sonnet"]
        );
        assert!(result.total_cost > 0.0);
    }

    #[test]
    fn test_quality_heuristic_caps_at_one() {
        let content = format!(
            "## Plan\n### Steps\nacceptance criteria\nfile main.py\n{}",
            "x".repeat(600)
        );
        let quality = estimate_quality(&content);
        assert!(quality <= 1.0);
        assert!(quality > 0.9);
    }

    #[test]
    fn test_statistics_track_provider_share() {
        let r = router(RouterConfig::default());
        r.route("check syntax", None);
        r.route("architect a novel design", None);

        let stats = r.get_statistics();
        assert_eq!(stats["total_routings"], 2);
        assert_eq!(stats["local_percentage"], 50.0);
    }
}
