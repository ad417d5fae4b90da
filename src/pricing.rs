//! Metering rates in raw, refreshed from the coin price.
//!
//! The operator quotes `price_kilo_requests` and `price_gigabytes` in a fiat
//! unit. Each maintainer tick converts them with the current coin price into
//! per-request and per-byte rates in raw (10^-30 NANO, a 128-bit integer)
//! and recomputes the balance-warn threshold. The data path reads the
//! snapshot under a short lock and may observe a stale but consistent value.

use std::sync::{Arc, RwLock};

/// Raw units per whole coin.
pub const RAW_PER_NANO: u128 = 10u128.pow(30);

/// Coin price used before the first successful price fetch.
pub const STARTUP_COIN_PRICE: f64 = 2.718281828;

#[derive(Debug, Clone, Copy, Default)]
pub struct Pricing {
    pub raw_per_request: u128,
    pub raw_per_byte: u128,
    pub balance_warn_threshold: u128,
}

pub type SharedPricing = Arc<RwLock<Pricing>>;

impl Pricing {
    /// Convert the configured fiat rates at `coin_price` (fiat per coin).
    pub fn from_rates(coin_price: f64, price_kilo_requests: f64, price_gigabytes: f64) -> Self {
        let cost_per_request = price_kilo_requests / 1_000.0;
        let cost_per_byte = price_gigabytes / 1e9;

        let raw_per_request = to_raw(cost_per_request * coin_price);
        let raw_per_byte = to_raw(cost_per_byte * coin_price);

        Self {
            raw_per_request,
            raw_per_byte,
            balance_warn_threshold: warn_threshold(raw_per_request, raw_per_byte),
        }
    }
}

/// Warn when the balance covers fewer than ~100 requests plus 10^4 bytes.
pub fn warn_threshold(raw_per_request: u128, raw_per_byte: u128) -> u128 {
    raw_per_request * 100 + raw_per_byte * 10u128.pow(4)
}

/// Convert a coin amount to raw, keeping 30 fractional digits.
///
/// Goes through a fixed-point decimal string so the fractional digits line
/// up exactly with the raw exponent instead of drifting through float
/// multiplication by 10^30.
pub fn to_raw(amount: f64) -> u128 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }

    let text = format!("{amount:.30}");
    let (integer, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));

    let whole: u128 = integer.parse().unwrap_or(0);
    let mut frac = fraction.to_string();
    frac.truncate(30);
    while frac.len() < 30 {
        frac.push('0');
    }
    let frac: u128 = frac.parse().unwrap_or(0);

    whole.saturating_mul(RAW_PER_NANO).saturating_add(frac)
}

pub fn new_shared(pricing: Pricing) -> SharedPricing {
    Arc::new(RwLock::new(pricing))
}

/// Snapshot read for the data path.
pub fn snapshot(shared: &SharedPricing) -> Pricing {
    *shared.read().expect("pricing lock poisoned")
}

/// Maintainer-side refresh.
pub fn store(shared: &SharedPricing, pricing: Pricing) {
    *shared.write().expect("pricing lock poisoned") = pricing;
}
