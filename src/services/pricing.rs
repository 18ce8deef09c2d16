//! Model pricing table and cost estimation.
//!
//! Callers supply raw token counts; cost is computed from per-million
//! input/output prices keyed by model name substring.

/// Pricing per million tokens for a specific model, USD.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// Known model pricing (costs in USD per million tokens).
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing { input: 15.0, output: 75.0 }),
    ("sonnet", ModelPricing { input: 3.0, output: 15.0 }),
    ("haiku", ModelPricing { input: 0.80, output: 4.0 }),
];

/// Fallback when a model is unknown: priced like the mid tier so an
/// unknown model never slips past the budget controller for free.
const DEFAULT_PRICING: ModelPricing = ModelPricing { input: 3.0, output: 15.0 };

/// Look up pricing by model name or alias. Matches substrings so a dated
/// release name still resolves to its family.
pub fn model_pricing(model: &str) -> Option<ModelPricing> {
    let model_lower = model.to_lowercase();
    PRICING_TABLE
        .iter()
        .find(|(name, _)| model_lower.contains(name))
        .map(|(_, pricing)| *pricing)
}

/// Estimate cost in USD for the given token counts.
pub fn estimate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let pricing = model_pricing(model).unwrap_or(DEFAULT_PRICING);
    (tokens_in as f64 * pricing.input + tokens_out as f64 * pricing.output) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_alias_lookup() {
        let pricing = model_pricing("opus").unwrap();
        assert_eq!(pricing.input, 15.0);
        assert_eq!(pricing.output, 75.0);
    }

    #[test]
    fn test_pricing_substring_match() {
        assert!(model_pricing("claude-sonnet-4-5-20250929").is_some());
        assert!(model_pricing("SONNET").is_some());
        assert!(model_pricing("gpt-x").is_none());
    }

    #[test]
    fn test_estimate_cost() {
        // 1M input tokens of opus = $15
        assert!((estimate_cost("opus", 1_000_000, 0) - 15.0).abs() < 1e-9);
        // 1M output tokens of haiku = $4
        assert!((estimate_cost("haiku", 0, 1_000_000) - 4.0).abs() < 1e-9);
        // mixed
        let cost = estimate_cost("sonnet", 10_000, 5_000);
        assert!((cost - (0.03 + 0.075)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_priced_at_default() {
        let cost = estimate_cost("mystery-model", 1_000_000, 0);
        assert!((cost - DEFAULT_PRICING.input).abs() < 1e-9);
    }
}
