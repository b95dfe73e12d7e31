use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

pub const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
pub const CACHE_READ_MULTIPLIER: f64 = 0.10;

/// Conservative default for models the table does not know.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice {
    input_per_million: 15.0,
    output_per_million: 75.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost in USD. Non-cached input tokens are distinct from cache
    /// read/write tokens; nothing is double-counted.
    pub fn cost_usd(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
    ) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million
            + cache_write_tokens as f64 * self.input_per_million * CACHE_WRITE_MULTIPLIER
            + cache_read_tokens as f64 * self.input_per_million * CACHE_READ_MULTIPLIER)
            / 1_000_000.0
    }
}

/// A dated model id like `claude-opus-4-6-20260101` must match
/// `claude-opus-4-6` before it matches `claude-opus`, so entries are kept
/// sorted by descending prefix length and scanned in order.
const PRICES: &[(&str, ModelPrice)] = &[
    ("claude-sonnet-4-5", ModelPrice::new(3.0, 15.0)),
    ("claude-haiku-4-5", ModelPrice::new(1.0, 5.0)),
    ("claude-opus-4-6", ModelPrice::new(5.0, 25.0)),
    ("claude-opus-4-5", ModelPrice::new(5.0, 25.0)),
    ("claude-opus-4-1", ModelPrice::new(15.0, 75.0)),
    ("claude-3-5-haiku", ModelPrice::new(0.8, 4.0)),
    ("gemini-2.5-flash", ModelPrice::new(0.3, 2.5)),
    ("gemini-2.5-pro", ModelPrice::new(1.25, 10.0)),
    ("claude-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-haiku", ModelPrice::new(1.0, 5.0)),
    ("gpt-5-nano", ModelPrice::new(0.05, 0.4)),
    ("gpt-5-mini", ModelPrice::new(0.25, 2.0)),
    ("claude-opus", ModelPrice::new(15.0, 75.0)),
    ("gpt-4.1", ModelPrice::new(2.0, 8.0)),
    ("gpt-4o", ModelPrice::new(2.5, 10.0)),
    ("gpt-5", ModelPrice::new(1.25, 10.0)),
    ("o3", ModelPrice::new(2.0, 8.0)),
];

const CONTEXT_WINDOWS: &[(&str, u64)] = &[
    ("claude-sonnet-4-5", 200_000),
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-2.5-pro", 1_048_576),
    ("claude", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-5", 400_000),
    ("o3", 200_000),
];

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Longest-prefix price lookup with a per-process memo.
#[derive(Debug, Default)]
pub struct PricingTable {
    memo: RwLock<HashMap<String, ModelPrice>>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price(&self, model: &str) -> ModelPrice {
        if let Ok(memo) = self.memo.read()
            && let Some(price) = memo.get(model)
        {
            return *price;
        }
        let price = lookup_price(model);
        if let Ok(mut memo) = self.memo.write() {
            memo.insert(model.to_string(), price);
        }
        price
    }
}

fn lookup_price(model: &str) -> ModelPrice {
    let mut best: Option<(&str, ModelPrice)> = None;
    for (prefix, price) in PRICES {
        if model.starts_with(prefix) {
            let replace = match best {
                Some((current, _)) => prefix.len() > current.len(),
                None => true,
            };
            if replace {
                best = Some((prefix, *price));
            }
        }
    }
    best.map(|(_, price)| price).unwrap_or(DEFAULT_PRICE)
}

pub fn context_window(model: &str) -> u64 {
    let mut best: Option<(&str, u64)> = None;
    for (prefix, window) in CONTEXT_WINDOWS {
        if model.starts_with(prefix) {
            let replace = match best {
                Some((current, _)) => prefix.len() > current.len(),
                None => true,
            };
            if replace {
                best = Some((prefix, *window));
            }
        }
    }
    best.map(|(_, window)| window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sonnet_cost_with_cache_tokens() {
        let table = PricingTable::new();
        let price = table.price("claude-sonnet-4-5");
        let cost = price.cost_usd(2000, 500, 5000, 2000);
        assert!((cost - 0.0225).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_conservative_default() {
        let table = PricingTable::new();
        let price = table.price("foo-bar");
        let cost = price.cost_usd(1000, 1000, 0, 0);
        assert!((cost - 0.090).abs() < 1e-9);
    }

    #[test]
    fn dated_model_matches_longest_prefix() {
        let table = PricingTable::new();
        let price = table.price("claude-opus-4-6-20260101");
        let cost = price.cost_usd(1000, 1000, 0, 0);
        assert!((cost - 0.030).abs() < 1e-9);
    }

    #[test]
    fn memo_is_stable_across_lookups() {
        let table = PricingTable::new();
        let first = table.price("claude-opus-4-6-20260101");
        let second = table.price("claude-opus-4-6-20260101");
        assert_eq!(first, second);
    }

    #[test]
    fn context_window_prefix_lookup() {
        assert_eq!(context_window("claude-sonnet-4-5-20250929"), 200_000);
        assert_eq!(context_window("gpt-5-2025-08-07"), 400_000);
        assert_eq!(context_window("totally-unknown"), DEFAULT_CONTEXT_WINDOW);
    }
}
