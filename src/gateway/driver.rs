//! The opaque per-venue capability, see spec.md §4.3/§6.
//!
//! Generalizes the teacher's `any`-typed scraper/executor split
//! (`scrapers::binance_session` for streaming, `vault::trade_executor` for
//! order submission) into one explicit trait so a driver only has to
//! implement what it actually supports -- unsupported calls are a
//! capability-bitmap check, never a runtime type error (spec.md §9).

use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::errors::EngineError;
use crate::types::{Instrument, OrderBookSnapshot, OrderRequest, OrderResult, TradingFees};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const STREAM_ORDER_BOOK = 0b0000_0001;
        const STREAM_TICKER     = 0b0000_0010;
        const STREAM_BALANCE    = 0b0000_0100;
        const FETCH_BALANCE     = 0b0000_1000;
        const CREATE_ORDER      = 0b0001_0000;
        const CANCEL_ORDER      = 0b0010_0000;
        const FETCH_TRADING_FEES = 0b0100_0000;
    }
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub currency: String,
    pub free: f64,
    pub locked: f64,
}

/// One update emitted from `stream_order_book`.
pub type BookUpdate = Result<OrderBookSnapshot, EngineError>;

/// A venue-side trading capability. Methods a driver doesn't support per its
/// `capabilities()` bitmap should return `EngineError::PermanentVenue`.
#[async_trait]
pub trait VenueDriver: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Depth values this venue accepts, ascending. Used for normalization,
    /// see spec.md §4.3 "Order-book depth normalization".
    fn accepted_depths(&self) -> &[u32];

    async fn load_instruments(&self) -> Result<Vec<Instrument>, EngineError>;

    async fn fetch_order_book(
        &self,
        instrument: &Instrument,
        depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError>;

    /// Starts a perpetual stream; each item is one snapshot or a transient
    /// error observed on the stream. The handle owns draining this.
    async fn stream_order_book(
        &self,
        instrument: &Instrument,
        depth: u32,
    ) -> Result<tokio::sync::mpsc::Receiver<BookUpdate>, EngineError>;

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, EngineError>;

    async fn fetch_trading_fees(&self, instrument: Option<&Instrument>) -> Result<TradingFees, EngineError>;

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderResult, EngineError>;

    async fn fetch_order(
        &self,
        venue_order_id: &str,
        instrument: &Instrument,
    ) -> Result<OrderResult, EngineError>;

    async fn fetch_recent_orders(
        &self,
        instrument: &Instrument,
        limit: u32,
    ) -> Result<Vec<OrderResult>, EngineError>;

    async fn cancel_order(&self, venue_order_id: &str, instrument: &Instrument) -> Result<(), EngineError>;

    async fn cancel_all_open_orders(&self) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Rounds a requested depth up to the smallest accepted value, capping at
/// the venue maximum. Returns `(depth, capped)`.
pub fn normalize_depth(accepted: &[u32], requested: u32) -> (u32, bool) {
    if accepted.is_empty() {
        return (requested, false);
    }
    match accepted.iter().find(|&&d| d >= requested) {
        Some(&d) => (d, false),
        None => (*accepted.iter().max().unwrap(), true),
    }
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_depth_rounds_up() {
        let accepted = [5, 20, 50, 100];
        assert_eq!(normalize_depth(&accepted, 0), (5, false));
        assert_eq!(normalize_depth(&accepted, 5), (5, false));
        assert_eq!(normalize_depth(&accepted, 6), (20, false));
        assert_eq!(normalize_depth(&accepted, 100), (100, false));
        assert_eq!(normalize_depth(&accepted, 101), (100, true));
    }

    #[test]
    fn normalize_depth_second_table() {
        let accepted = [1, 50, 200, 1000];
        assert_eq!(normalize_depth(&accepted, 2), (50, false));
        assert_eq!(normalize_depth(&accepted, 1001), (1000, true));
    }
}
