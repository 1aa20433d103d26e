//! Per-venue fee cache with a 24h TTL, see spec.md §3 TradingFees and §4.3
//! "Fees".
//!
//! Grounded in the teacher's `arbitrage::fees::FeeStructure`/`FeeCalculator`
//! shape, generalized to a refresh-on-miss cache keyed by instrument with a
//! per-venue wildcard fallback.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{Instrument, TradingFees};

const FEE_TTL: chrono::Duration = chrono::Duration::hours(24);

/// Conservative values used when a fetch fails and nothing cached is fresh.
pub const DEFAULT_FEES: TradingFees = TradingFees {
    maker_rate: 0.002,
    taker_rate: 0.002,
    percentage_flag: true,
    last_refreshed: DateTime::<Utc>::MIN_UTC,
};

#[derive(Default)]
pub struct FeeCache {
    /// `None` key is the per-venue wildcard.
    entries: RwLock<HashMap<Option<Instrument>, TradingFees>>,
}

impl FeeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_wildcard(&self, fees: TradingFees) {
        self.entries.write().insert(None, fees);
    }

    pub fn put_instrument(&self, instrument: Instrument, fees: TradingFees) {
        self.entries.write().insert(Some(instrument), fees);
    }

    /// Per-instrument entry overrides the wildcard. A miss or stale entry
    /// falls back to the per-venue conservative default.
    pub fn lookup(&self, instrument: &Instrument, now: DateTime<Utc>) -> TradingFees {
        let guard = self.entries.read();
        if let Some(fees) = guard.get(&Some(instrument.clone())) {
            if !fees.is_expired(now, FEE_TTL) {
                return *fees;
            }
        }
        if let Some(fees) = guard.get(&None) {
            if !fees.is_expired(now, FEE_TTL) {
                return *fees;
            }
        }
        DEFAULT_FEES
    }
}
