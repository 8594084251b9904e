use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use rad_protocol::chunk::ChunkUsage;

/// USD per 1,000 tokens, separate input/output rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Immutable after init; built once during startup.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new(models: HashMap<String, ModelPricing>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        let mut put = |name: &str, input: f64, output: f64| {
            models.insert(
                name.to_string(),
                ModelPricing {
                    input_per_1k: input,
                    output_per_1k: output,
                },
            );
        };
        put("gpt-4", 0.03, 0.06);
        put("gpt-4-turbo", 0.01, 0.03);
        put("gpt-4o", 0.0025, 0.01);
        put("gpt-4o-mini", 0.00015, 0.0006);
        put("gpt-3.5-turbo", 0.0005, 0.0015);
        put("text-embedding-3-small", 0.00002, 0.0);
        put("text-embedding-3-large", 0.00013, 0.0);
        put("claude-3-opus", 0.015, 0.075);
        put("claude-3-sonnet", 0.003, 0.015);
        put("claude-3-haiku", 0.00025, 0.00125);
        put("claude-3-5-sonnet", 0.003, 0.015);
        put("claude-3-5-haiku", 0.0008, 0.004);
        put("gemini-1.5-pro", 0.00125, 0.005);
        put("gemini-1.5-flash", 0.000075, 0.0003);
        put("gemini-2.0-flash", 0.0001, 0.0004);
        Self { models }
    }

    /// Exact id first, then the canonical base name with date/`:snapshot`
    /// suffixes stripped.
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        if let Some(pricing) = self.models.get(model) {
            return Some(*pricing);
        }
        self.models.get(&canonical_model(model)).copied()
    }

    /// Unknown model yields `None` (cost omitted, not zero) and an
    /// accounting warning.
    pub fn cost(&self, model: &str, usage: &ChunkUsage) -> Option<f64> {
        match self.lookup(model) {
            Some(pricing) => Some(
                usage.prompt_tokens as f64 / 1000.0 * pricing.input_per_1k
                    + usage.completion_tokens as f64 / 1000.0 * pricing.output_per_1k,
            ),
            None => {
                warn!(event = "pricing_miss", model = %model, "no pricing entry; cost omitted");
                None
            }
        }
    }
}

/// Strips `-YYYY-MM-DD` date suffixes and `:snapshot` suffixes.
pub fn canonical_model(model: &str) -> String {
    let model = model.split(':').next().unwrap_or(model);
    if let Some(base) = strip_date_suffix(model) {
        base.to_string()
    } else {
        model.to_string()
    }
}

fn strip_date_suffix(model: &str) -> Option<&str> {
    // `<base>-YYYY-MM-DD`
    let (base, suffix) = model.rsplit_once('-').and_then(|(left, day)| {
        let (left, month) = left.rsplit_once('-')?;
        let (base, year) = left.rsplit_once('-')?;
        Some((base, (year, month, day)))
    })?;
    let (year, month, day) = suffix;
    let all_digits = |value: &str, len: usize| {
        value.len() == len && value.bytes().all(|byte| byte.is_ascii_digit())
    };
    (all_digits(year, 4) && all_digits(month, 2) && all_digits(day, 2)).then_some(base)
}

/// Per-model aggregate maintained by [`CostTracker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

/// Process-wide cost aggregation; serialized under a lock.
#[derive(Debug, Default)]
pub struct CostTracker {
    inner: Mutex<HashMap<String, ModelCost>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, usage: &ChunkUsage, cost_usd: Option<f64>) {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        let entry = inner.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        if let Some(cost) = cost_usd {
            entry.cost_usd += cost;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, ModelCost> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}
