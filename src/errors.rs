//! Typed error kinds, see spec.md §7.
//!
//! `IdempotencyHit` is deliberately absent here: per spec.md it is not an
//! error, it's the `Ok` path of `executeTrade` returning a hydrated
//! `OrderResult` from the `recentOrders` cache.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal at init.
    #[error("config error: {0}")]
    Config(String),

    /// Network, timeout, throttling -- triggers rate-limit backoff or
    /// reconnection.
    #[error("transient venue error ({venue}): {message}")]
    TransientVenue { venue: String, message: String },

    /// Authentication, unknown instrument -- logged, venue excluded from the
    /// current scan.
    #[error("permanent venue error ({venue}): {message}")]
    PermanentVenue { venue: String, message: String },

    /// e.g. a sell attempted with no successful buy. Fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Fresh balance insufficient at submission time.
    #[error("balance race on {venue}/{currency}: needed {needed}, available {available}")]
    BalanceRace {
        venue: String,
        currency: String,
        needed: f64,
        available: f64,
    },

    /// Book older than threshold.
    #[error("stale book for {instrument} on {venue}: age {age_ms}ms > threshold {threshold_ms}ms")]
    Staleness {
        instrument: String,
        venue: String,
        age_ms: i64,
        threshold_ms: i64,
    },

    /// Buy filled below `partialFillThreshold` -- buy leg is stranded.
    #[error("partial fill rejected for {trade_key}: {fill_percent:.1}% < {threshold:.1}% (manual intervention may be required)")]
    PartialFillRejected {
        trade_key: String,
        fill_percent: f64,
        threshold: f64,
    },

    /// Ledger write failed. Fatal for the affected trade path.
    #[error("ledger write failed: {0}")]
    LedgerIo(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
