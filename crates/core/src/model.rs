//! Built-in model catalog.
//!
//! Prices are in USD per 1 million tokens. Custom models can be registered
//! at runtime (for instance from configuration or by tests).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::provider::Usage;

/// Static metadata for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Catalog key (e.g., "claude-3.7-sonnet")
    pub id: String,
    /// Display name
    pub name: String,
    /// Provider tag used for dispatch (e.g., "anthropic", "openai")
    pub provider: String,
    /// Model name sent over the wire
    pub api_model: String,
    pub context_window: u64,
    pub default_max_tokens: u32,
    pub cost_per_1m_in: f64,
    pub cost_per_1m_out: f64,
    #[serde(default)]
    pub cost_per_1m_in_cached: f64,
    #[serde(default)]
    pub cost_per_1m_out_cached: f64,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    /// Whether the model streams reasoning content
    #[serde(default)]
    pub can_reason: bool,
}

fn default_true() -> bool {
    true
}

impl ModelInfo {
    /// A free model entry with the wire name equal to its ID.
    pub fn new(id: impl Into<String>, provider: impl Into<String>, context_window: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            api_model: id.clone(),
            id,
            provider: provider.into(),
            context_window,
            default_max_tokens: 4_096,
            cost_per_1m_in: 0.0,
            cost_per_1m_out: 0.0,
            cost_per_1m_in_cached: 0.0,
            cost_per_1m_out_cached: 0.0,
            supports_vision: false,
            supports_tools: true,
            can_reason: false,
        }
    }

    pub fn with_costs(mut self, per_1m_in: f64, per_1m_out: f64) -> Self {
        self.cost_per_1m_in = per_1m_in;
        self.cost_per_1m_out = per_1m_out;
        self
    }

    /// Compute cost for the given usage.
    pub fn cost(&self, usage: Usage) -> f64 {
        (usage.input_tokens as f64 * self.cost_per_1m_in
            + usage.output_tokens as f64 * self.cost_per_1m_out)
            / 1_000_000.0
    }
}

#[allow(clippy::too_many_arguments)]
fn model(
    id: &str,
    name: &str,
    provider: &str,
    api_model: &str,
    context_window: u64,
    default_max_tokens: u32,
    (cost_in, cost_out): (f64, f64),
    (cached_in, cached_out): (f64, f64),
) -> ModelInfo {
    ModelInfo {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
        api_model: api_model.into(),
        context_window,
        default_max_tokens,
        cost_per_1m_in: cost_in,
        cost_per_1m_out: cost_out,
        cost_per_1m_in_cached: cached_in,
        cost_per_1m_out_cached: cached_out,
        supports_vision: true,
        supports_tools: true,
        can_reason: false,
    }
}

/// Thread-safe model table with built-in defaults and custom entries.
pub struct ModelCatalog {
    models: RwLock<HashMap<String, ModelInfo>>,
}

impl ModelCatalog {
    /// Create a catalog with the built-in models.
    pub fn with_defaults() -> Self {
        let mut models = HashMap::new();
        let mut add = |m: ModelInfo| {
            models.insert(m.id.clone(), m);
        };

        // ── Anthropic ──────────────────────────────────────────────
        add(model(
            "claude-3.5-sonnet",
            "Claude 3.5 Sonnet",
            "anthropic",
            "claude-3-5-sonnet-latest",
            200_000,
            5_000,
            (3.0, 15.0),
            (3.75, 0.30),
        ));
        add(ModelInfo {
            can_reason: true,
            ..model(
                "claude-3.7-sonnet",
                "Claude 3.7 Sonnet",
                "anthropic",
                "claude-3-7-sonnet-latest",
                200_000,
                50_000,
                (3.0, 15.0),
                (3.75, 0.30),
            )
        });
        add(model(
            "claude-3.5-haiku",
            "Claude 3.5 Haiku",
            "anthropic",
            "claude-3-5-haiku-latest",
            200_000,
            4_096,
            (0.80, 4.0),
            (1.0, 0.08),
        ));
        add(model(
            "claude-3-opus",
            "Claude 3 Opus",
            "anthropic",
            "claude-3-opus-latest",
            200_000,
            4_096,
            (15.0, 75.0),
            (18.75, 1.50),
        ));
        add(ModelInfo {
            can_reason: true,
            ..model(
                "claude-4-sonnet",
                "Claude Sonnet 4",
                "anthropic",
                "claude-sonnet-4-20250514",
                200_000,
                50_000,
                (3.0, 15.0),
                (3.75, 0.30),
            )
        });

        // ── OpenAI ─────────────────────────────────────────────────
        add(model(
            "gpt-4o",
            "GPT-4o",
            "openai",
            "gpt-4o",
            128_000,
            4_096,
            (2.5, 10.0),
            (1.25, 0.0),
        ));
        add(model(
            "gpt-4o-mini",
            "GPT-4o mini",
            "openai",
            "gpt-4o-mini",
            128_000,
            4_096,
            (0.15, 0.6),
            (0.075, 0.0),
        ));
        add(model(
            "gpt-4.1",
            "GPT-4.1",
            "openai",
            "gpt-4.1",
            1_047_576,
            20_000,
            (2.0, 8.0),
            (0.5, 0.0),
        ));
        add(ModelInfo {
            can_reason: true,
            supports_vision: false,
            ..model(
                "o3-mini",
                "o3 mini",
                "openai",
                "o3-mini",
                200_000,
                50_000,
                (1.1, 4.4),
                (0.55, 0.0),
            )
        });

        // ── Groq (OpenAI-compatible) ───────────────────────────────
        add(ModelInfo {
            supports_vision: false,
            ..model(
                "llama-3.3-70b-versatile",
                "Llama 3.3 70B",
                "groq",
                "llama-3.3-70b-versatile",
                128_000,
                4_096,
                (0.59, 0.79),
                (0.0, 0.0),
            )
        });

        Self {
            models: RwLock::new(models),
        }
    }

    /// Create an empty catalog.
    pub fn empty() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a model by catalog ID.
    pub fn get(&self, id: &str) -> Option<ModelInfo> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models.get(id).cloned()
    }

    /// Add or replace a model.
    pub fn register(&self, model: ModelInfo) {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models.insert(model.id.clone(), model);
    }

    /// All models, sorted by provider then ID.
    pub fn list(&self) -> Vec<ModelInfo> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ModelInfo> = models.values().cloned().collect();
        all.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        all
    }

    /// Models served by `provider`.
    pub fn by_provider(&self, provider: &str) -> Vec<ModelInfo> {
        self.list()
            .into_iter()
            .filter(|m| m.provider == provider)
            .collect()
    }

    /// Compute cost for a model call, returning 0.0 if the model is unknown.
    pub fn cost(&self, id: &str, usage: Usage) -> f64 {
        self.get(id).map(|m| m.cost(usage)).unwrap_or(0.0)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_claude_and_gpt() {
        let catalog = ModelCatalog::with_defaults();
        let sonnet = catalog.get("claude-3.7-sonnet").unwrap();
        assert_eq!(sonnet.provider, "anthropic");
        assert_eq!(sonnet.context_window, 200_000);
        assert!(sonnet.can_reason);
        assert_eq!(catalog.get("gpt-4o").unwrap().provider, "openai");
        assert!(catalog.get("gpt-9").is_none());
    }

    #[test]
    fn cost_is_per_million_tokens() {
        let catalog = ModelCatalog::with_defaults();
        // 1M input at $3 + 100k output at $15/M = 3 + 1.5
        let cost = catalog.cost("claude-3.5-sonnet", Usage::new(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let catalog = ModelCatalog::empty();
        assert_eq!(catalog.cost("nope", Usage::new(10, 10)), 0.0);
    }

    #[test]
    fn register_custom_model() {
        let catalog = ModelCatalog::empty();
        catalog.register(model("tiny", "Tiny", "mock", "tiny", 1_000, 100, (1.0, 2.0), (0.0, 0.0)));
        assert_eq!(catalog.by_provider("mock").len(), 1);
        assert_eq!(catalog.list()[0].context_window, 1_000);
    }
}
