//! Per-model token pricing.

use once_cell::sync::Lazy;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Applied to models missing from the table. Priced at the top tier so an
/// unknown model is never undercharged.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice {
    input_per_million: 15.0,
    output_per_million: 75.0,
};

/// Model id prefixes and their prices. First match wins, so more specific
/// prefixes come first.
static PRICE_TABLE: Lazy<Vec<(&'static str, ModelPrice)>> = Lazy::new(|| {
    vec![
        ("claude-opus-4", DEFAULT_PRICE),
        ("claude-3-opus", DEFAULT_PRICE),
        (
            "claude-sonnet-4",
            ModelPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        ),
        (
            "claude-3-7-sonnet",
            ModelPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        ),
        (
            "claude-3-5-sonnet",
            ModelPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        ),
        (
            "claude-haiku-4",
            ModelPrice {
                input_per_million: 1.0,
                output_per_million: 5.0,
            },
        ),
        (
            "claude-3-5-haiku",
            ModelPrice {
                input_per_million: 0.8,
                output_per_million: 4.0,
            },
        ),
    ]
});

pub fn price_for(model: &str) -> ModelPrice {
    PRICE_TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE)
}

/// Cost in cents. Each term is `tokens * usd_per_million / 10_000`; the sum
/// is rounded once, never per term.
pub fn cost_cents(model: &str, input_tokens: u64, output_tokens: u64) -> i64 {
    let price = price_for(model);
    let cents = input_tokens as f64 * price.input_per_million / 10_000.0
        + output_tokens as f64 * price.output_per_million / 10_000.0;
    cents.round().max(0.0) as i64
}
