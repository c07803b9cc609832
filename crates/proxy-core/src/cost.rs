//! Converts a per-request token usage breakdown into an estimated USD cost.
//!
//! Pricing is looked up by a prefix match against the model id since
//! dated model snapshots (`claude-3-5-sonnet-20241022`) share pricing with
//! their family. Unknown models fall back to `None` rather than a guessed
//! price.

use account_store::RequestUsage;

struct Pricing {
    prefix: &'static str,
    input_per_mtok: f64,
    output_per_mtok: f64,
    cache_read_per_mtok: f64,
    cache_write_per_mtok: f64,
}

const PRICING_TABLE: &[Pricing] = &[
    Pricing {
        prefix: "claude-opus-4",
        input_per_mtok: 15.0,
        output_per_mtok: 75.0,
        cache_read_per_mtok: 1.5,
        cache_write_per_mtok: 18.75,
    },
    Pricing {
        prefix: "claude-3-5-sonnet",
        input_per_mtok: 3.0,
        output_per_mtok: 15.0,
        cache_read_per_mtok: 0.3,
        cache_write_per_mtok: 3.75,
    },
    Pricing {
        prefix: "claude-3-5-haiku",
        input_per_mtok: 0.8,
        output_per_mtok: 4.0,
        cache_read_per_mtok: 0.08,
        cache_write_per_mtok: 1.0,
    },
];

fn pricing_for(model: &str) -> Option<&'static Pricing> {
    PRICING_TABLE.iter().find(|p| model.starts_with(p.prefix))
}

/// Compute the estimated USD cost for a usage row. Returns `None` when the
/// model is unrecognized so callers can persist a null cost rather than a
/// misleading zero.
pub fn estimate_cost_usd(usage: &RequestUsage) -> Option<f64> {
    let model = usage.model.as_deref()?;
    let pricing = pricing_for(model)?;

    let input_cost = usage.input_tokens as f64 / 1_000_000.0 * pricing.input_per_mtok;
    let output_cost = usage.output_tokens as f64 / 1_000_000.0 * pricing.output_per_mtok;
    let cache_read_cost = usage.cache_read_input_tokens as f64 / 1_000_000.0 * pricing.cache_read_per_mtok;
    let cache_write_cost = usage.cache_creation_input_tokens as f64 / 1_000_000.0 * pricing.cache_write_per_mtok;

    Some(input_cost + output_cost + cache_read_cost + cache_write_cost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_returns_none() {
        let usage = RequestUsage {
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        assert!(estimate_cost_usd(&usage).is_none());
    }

    #[test]
    fn missing_model_returns_none() {
        let usage = RequestUsage::default();
        assert!(estimate_cost_usd(&usage).is_none());
    }

    #[test]
    fn haiku_cost_matches_expected_rate() {
        let usage = RequestUsage {
            model: Some("claude-3-5-haiku-20241022".into()),
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Default::default()
        };
        let cost = estimate_cost_usd(&usage).unwrap();
        assert!((cost - 4.8).abs() < 1e-9);
    }

    #[test]
    fn cache_tokens_use_distinct_rates() {
        let usage = RequestUsage {
            model: Some("claude-3-5-sonnet-20241022".into()),
            cache_read_input_tokens: 1_000_000,
            cache_creation_input_tokens: 1_000_000,
            ..Default::default()
        };
        let cost = estimate_cost_usd(&usage).unwrap();
        assert!((cost - 4.05).abs() < 1e-9);
    }
}
