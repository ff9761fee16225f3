//! Model registry and per-call cost computation.
//!
//! The Runner (see [`crate::runner`]) consults a [`ModelRegistry`] to resolve a model id or
//! alias to its capabilities (tool use, streaming, json output, context length) and to price a
//! [`TokenUsage`](crate::client_wrapper::TokenUsage) once a call completes. Three pricing shapes
//! are supported, matching the teacher's plain-struct style (see
//! [`crate::config::CloudLLMConfig`]) rather than a builder or generic-price-list abstraction.

use chrono::{DateTime, Timelike, Utc};

use crate::cloudllm::client_wrapper::TokenUsage;

/// How a model's usage is converted into a dollar cost.
#[derive(Debug, Clone)]
pub enum Pricing {
    /// Flat per-million-token rates for input and output tokens respectively.
    Flat { per_million_in: f64, per_million_out: f64 },
    /// Two-band pricing selected by comparing total input tokens against `threshold`: the whole
    /// call is priced at `below` if `input_tokens <= threshold`, else at `above`.
    Tiered { threshold: usize, below: FlatRate, above: FlatRate },
    /// Peak/off-peak pricing selected by whether the usage timestamp's UTC wall-clock time falls
    /// within `[peak_start_utc, peak_end_utc)`.
    TimeOfDay { peak_start_utc: u32, peak_end_utc: u32, peak: FlatRate, off_peak: FlatRate },
}

/// A plain per-million-token rate pair, reused by [`Pricing::Tiered`] and [`Pricing::TimeOfDay`].
#[derive(Debug, Clone, Copy)]
pub struct FlatRate {
    pub per_million_in: f64,
    pub per_million_out: f64,
}

impl FlatRate {
    fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.per_million_in
            + (usage.output_tokens as f64 / 1_000_000.0) * self.per_million_out
    }
}

/// Content modality a model can accept or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
    Audio,
}

/// A single entry in the [`ModelRegistry`].
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    pub aliases: Vec<String>,
    pub pricing: Pricing,
    pub image_price_per_unit: Option<f64>,
    pub context_length: usize,
    pub modalities: Vec<Modality>,
    pub supports_tool_use: bool,
    pub supports_streaming: bool,
    pub supports_json_output: bool,
    pub supports_reasoning_output: bool,
    pub disabled: bool,
    /// If the provider's rate limit is hit, the Runner retries against this model id instead.
    pub rate_limit_fallback: Option<String>,
}

impl ModelEntry {
    /// Computes the dollar cost of `usage`, evaluated against `at` for time-of-day pricing.
    /// `free_tier` forces a cost of zero regardless of pricing shape, per the usage-level
    /// free-tier override.
    pub fn cost(&self, usage: &TokenUsage, at: DateTime<Utc>, free_tier: bool) -> f64 {
        if free_tier {
            return 0.0;
        }
        match &self.pricing {
            Pricing::Flat { per_million_in, per_million_out } => {
                FlatRate { per_million_in: *per_million_in, per_million_out: *per_million_out }.cost(usage)
            }
            Pricing::Tiered { threshold, below, above } => {
                if usage.input_tokens <= *threshold {
                    below.cost(usage)
                } else {
                    above.cost(usage)
                }
            }
            Pricing::TimeOfDay { peak_start_utc, peak_end_utc, peak, off_peak } => {
                let hour = at.hour();
                if hour >= *peak_start_utc && hour < *peak_end_utc {
                    peak.cost(usage)
                } else {
                    off_peak.cost(usage)
                }
            }
        }
    }
}

/// A registry of known models, resolved by exact id or alias.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: ModelEntry) {
        self.entries.push(entry);
    }

    /// Resolves `id` to a registered model: first by exact `id` match, then by alias membership.
    /// Logs at `warn` on a miss, matching the teacher's `orchestration.rs` failure-logging idiom.
    pub fn find_model(&self, id: &str) -> Option<&ModelEntry> {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Some(entry);
        }
        let found = self.entries.iter().find(|e| e.aliases.iter().any(|a| a == id));
        if found.is_none() {
            log::warn!("model registry miss for id/alias '{id}'");
        }
        found
    }

    pub fn enabled_entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.iter().filter(|e| !e.disabled)
    }

    pub fn disable(&mut self, id: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.disabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: usize, output: usize) -> TokenUsage {
        TokenUsage { input_tokens: input, output_tokens: output, total_tokens: input + output }
    }

    #[test]
    fn exact_and_alias_resolution() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelEntry {
            id: "gpt-4.1".into(),
            provider: "openai".into(),
            aliases: vec!["gpt4.1".into()],
            pricing: Pricing::Flat { per_million_in: 2.0, per_million_out: 8.0 },
            image_price_per_unit: None,
            context_length: 128_000,
            modalities: vec![Modality::Text],
            supports_tool_use: true,
            supports_streaming: true,
            supports_json_output: true,
            supports_reasoning_output: false,
            disabled: false,
            rate_limit_fallback: None,
        });
        assert!(registry.find_model("gpt-4.1").is_some());
        assert!(registry.find_model("gpt4.1").is_some());
        assert!(registry.find_model("nope").is_none());
    }

    #[test]
    fn tiered_pricing_selects_band_by_input_tokens() {
        let entry = ModelEntry {
            id: "m".into(),
            provider: "p".into(),
            aliases: vec![],
            pricing: Pricing::Tiered {
                threshold: 1000,
                below: FlatRate { per_million_in: 1.0, per_million_out: 1.0 },
                above: FlatRate { per_million_in: 5.0, per_million_out: 5.0 },
            },
            image_price_per_unit: None,
            context_length: 1000,
            modalities: vec![Modality::Text],
            supports_tool_use: false,
            supports_streaming: false,
            supports_json_output: false,
            supports_reasoning_output: false,
            disabled: false,
            rate_limit_fallback: None,
        };
        let now = Utc::now();
        let cheap = entry.cost(&usage(500, 500), now, false);
        let expensive = entry.cost(&usage(2000, 500), now, false);
        assert!(expensive > cheap);
    }

    #[test]
    fn free_tier_forces_zero_cost() {
        let entry = ModelEntry {
            id: "m".into(),
            provider: "p".into(),
            aliases: vec![],
            pricing: Pricing::Flat { per_million_in: 9.0, per_million_out: 9.0 },
            image_price_per_unit: None,
            context_length: 1000,
            modalities: vec![Modality::Text],
            supports_tool_use: false,
            supports_streaming: false,
            supports_json_output: false,
            supports_reasoning_output: false,
            disabled: false,
            rate_limit_fallback: None,
        };
        assert_eq!(entry.cost(&usage(1_000_000, 1_000_000), Utc::now(), true), 0.0);
    }
}
