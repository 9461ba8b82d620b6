//! Per-model pricing for router cost accounting.
//!
//! Prices are kept in nanodollars per token (1 USD = 1_000_000_000) so the
//! running total is exact integer arithmetic.

use crate::llm::TokenUsage;

pub const NANOS_PER_USD: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nano_per_token: u64,
    pub output_nano_per_token: u64,
}

/// Strip provider prefixes and dated suffixes: `openai/gpt-4o-2024-08-06` -> `gpt-4o`.
fn normalize_model(model: &str) -> &str {
    let name = model.trim();
    let name = name.rsplit('/').next().unwrap_or(name);
    match name {
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4-turbo") => "gpt-4-turbo",
        s if s.contains("gpt-4.1-mini") => "gpt-4.1-mini",
        s if s.contains("gpt-4.1") => "gpt-4.1",
        s if s.starts_with("gpt-4") => "gpt-4",
        s if s.contains("gpt-3.5") => "gpt-3.5-turbo",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-sonnet-4") || s.contains("claude-3-5-sonnet") => "claude-sonnet",
        s if s.contains("gemini-2.0-flash") || s.contains("gemini-2-0-flash") => "gemini-2.0-flash",
        other => other,
    }
}

/// Pricing for a model, `None` when unknown.
///
/// `$X per 1M tokens` = `X * 1000` nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    let (input, output) = match normalize_model(model) {
        "gpt-4o-mini" => (150, 600),
        "gpt-4o" => (2_500, 10_000),
        "gpt-4.1-mini" => (400, 1_600),
        "gpt-4.1" => (2_000, 8_000),
        "gpt-4-turbo" => (10_000, 30_000),
        "gpt-4" => (30_000, 60_000),
        "gpt-3.5-turbo" => (500, 1_500),
        "claude-3-5-haiku" => (800, 4_000),
        "claude-sonnet" => (3_000, 15_000),
        "gemini-2.0-flash" => (100, 400),
        _ => return None,
    };
    Some(ModelPricing {
        input_nano_per_token: input,
        output_nano_per_token: output,
    })
}

/// Cost of one call in nanodollars. Unknown models cost 0.
pub fn cost_nanos(model: &str, usage: &TokenUsage) -> u64 {
    if usage.total() == 0 {
        return 0;
    }
    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation, using 0 cost");
        return 0;
    };
    usage
        .prompt_tokens
        .saturating_mul(pricing.input_nano_per_token)
        .saturating_add(
            usage
                .completion_tokens
                .saturating_mul(pricing.output_nano_per_token),
        )
}

pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("openai/gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(normalize_model("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(normalize_model("gpt-4-0613"), "gpt-4");
        assert_eq!(normalize_model("gpt-3.5-turbo-1106"), "gpt-3.5-turbo");
    }

    #[test]
    fn test_cost_small_vs_large() {
        // 1000 prompt + 200 completion tokens
        let usage = TokenUsage::new(1_000, 200);
        // 1000*150 + 200*600 = 270_000 nanodollars
        assert_eq!(cost_nanos("gpt-4o-mini", &usage), 270_000);
        // 1000*2500 + 200*10000 = 4_500_000 nanodollars
        assert_eq!(cost_nanos("gpt-4o", &usage), 4_500_000);
        assert!((nanos_to_usd(4_500_000) - 0.0045).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_and_empty_usage_cost_nothing() {
        assert_eq!(cost_nanos("mystery-model", &TokenUsage::new(100, 100)), 0);
        assert_eq!(cost_nanos("gpt-4o", &TokenUsage::default()), 0);
    }
}
