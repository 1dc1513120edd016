//! Synthetic feed generator
//!
//! Stands in for the live server when no transport is available: produces
//! plausible latency readings and random-walk quotes for subscribed symbols
//! so consumers never observe a dead feed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

/// Largest per-tick relative price move (0.5%)
const MAX_STEP: f64 = 0.005;

/// Last synthetic quote of one symbol
#[derive(Debug, Clone, Copy)]
struct Quote {
    open: f64,
    price: f64,
}

/// Local generator of substitute telemetry
pub struct SyntheticFeed {
    rng: StdRng,
    latency_ms: Range<u64>,
    quotes: HashMap<String, Quote>,
}

impl SyntheticFeed {
    /// Generator seeded from OS entropy
    pub fn new(latency_ms: Range<u64>) -> Self {
        Self::with_rng(StdRng::from_entropy(), latency_ms)
    }

    /// Deterministic generator
    pub fn seeded(seed: u64, latency_ms: Range<u64>) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), latency_ms)
    }

    fn with_rng(rng: StdRng, latency_ms: Range<u64>) -> Self {
        // An empty range would panic in gen_range
        let latency_ms = if latency_ms.start < latency_ms.end {
            latency_ms
        } else {
            latency_ms.start..latency_ms.start + 1
        };
        Self {
            rng,
            latency_ms,
            quotes: HashMap::new(),
        }
    }

    /// Latency uniformly sampled from the configured range
    pub fn sample_latency(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.latency_ms.clone()))
    }

    /// Next quote payload for `symbol`, shaped like a live
    /// `market_data_update` body and flagged `synthetic`.
    pub fn next_quote(&mut self, symbol: &str) -> Value {
        let mut quote = self.next_tick(symbol);
        quote["synthetic"] = Value::Bool(true);
        quote
    }

    /// Advance the random walk of `symbol` and return the unflagged payload
    pub fn next_tick(&mut self, symbol: &str) -> Value {
        let rng = &mut self.rng;
        let quote = self
            .quotes
            .entry(symbol.to_owned())
            .or_insert_with(|| {
                let open = rng.gen_range(20.0..500.0);
                Quote { open, price: open }
            });

        let step = self.rng.gen_range(-MAX_STEP..MAX_STEP);
        quote.price = (quote.price * (1.0 + step)).max(0.01);

        let change = quote.price - quote.open;
        let change_percent = change / quote.open * 100.0;
        let volume: u64 = self.rng.gen_range(1_000..250_000);

        json!({
            "symbol": symbol,
            "price": round_to(quote.price, 2),
            "change": round_to(change, 4),
            "change_percent": round_to(change_percent, 2),
            "volume": volume,
        })
    }

    /// Forget random-walk state of symbols no longer subscribed
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.quotes.retain(|symbol, _| keep(symbol));
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
