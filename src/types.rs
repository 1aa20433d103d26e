//! Core data model: instruments, venues, order books, opportunities, orders,
//! ledger entries. See spec.md §3.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a trading venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VenueId(pub String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A tradable pair identifier "BASE/QUOTE".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument(pub String);

impl Instrument {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Split on "/" into (base, quote). Panics on malformed instruments --
    /// `config::Config::from_env` validates every `TRADING_SYMBOLS` entry
    /// through `parse_instrument` before it reaches here.
    pub fn base_quote(&self) -> (&str, &str) {
        self.0
            .split_once('/')
            .unwrap_or_else(|| panic!("malformed instrument: {}", self.0))
    }

    pub fn base(&self) -> &str {
        self.base_quote().0
    }

    pub fn quote(&self) -> &str {
        self.base_quote().1
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderType {
    Market,
    Limit,
}

/// One resting level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub amount: f64,
}

/// Asks ascending by price, bids descending. The producer (VenueDriver) is
/// responsible for ordering; this type does not re-sort.
pub type OrderBookSide = Vec<PriceLevel>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub venue: VenueId,
    pub instrument: Instrument,
    pub asks: OrderBookSide,
    pub bids: OrderBookSide,
    /// Authoritative for age reasoning.
    pub venue_timestamp: DateTime<Utc>,
    /// Recorded for skew monitoring only.
    pub local_receive_timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Walk levels on `side` to fill `amount`, returning the volume-weighted
    /// average price and the slippage vs the best quote as a fraction
    /// (0.02 == 2%). Returns `None` if the book cannot fill `amount`.
    pub fn slippage_for(&self, side: Side, amount: f64) -> Option<f64> {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let best = levels.first()?.price;
        if best <= 0.0 || amount <= 0.0 {
            return None;
        }

        let mut remaining = amount;
        let mut notional = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(level.amount);
            notional += take * level.price;
            remaining -= take;
        }
        if remaining > 1e-9 {
            return None;
        }
        let vwap = notional / amount;
        Some(((vwap - best) / best).abs())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingFees {
    pub maker_rate: f64,
    pub taker_rate: f64,
    pub percentage_flag: bool,
    pub last_refreshed: DateTime<Utc>,
}

impl TradingFees {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_refreshed) > ttl
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub buy_fee: f64,
    pub sell_fee: f64,
    pub total: f64,
}

/// Derived, immutable. Created on scan, discarded after decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub instrument: Instrument,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_price: f64,
    pub sell_price: f64,
    pub amount: f64,
    pub profit_percent: f64,
    pub profit_amount: f64,
    pub timestamp: DateTime<Utc>,
    pub fees: FeeBreakdown,
}

impl Opportunity {
    /// Unique key per inflight (instrument, buyVenue, sellVenue) pair.
    pub fn trade_key(&self) -> String {
        trade_key(&self.instrument, &self.buy_venue, &self.sell_venue)
    }
}

pub fn trade_key(instrument: &Instrument, buy_venue: &VenueId, sell_venue: &VenueId) -> String {
    format!("{instrument}-{buy_venue}-{sell_venue}")
}

/// `clientOrderId` is the idempotency key and is mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub venue: VenueId,
    pub instrument: Instrument,
    pub side: Side,
    pub amount: f64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub client_order_id: Uuid,
}

impl OrderRequest {
    pub fn market(venue: VenueId, instrument: Instrument, side: Side, amount: f64) -> Self {
        Self {
            venue,
            instrument,
            side,
            amount,
            order_type: OrderType::Market,
            price: None,
            client_order_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub venue: VenueId,
    pub venue_order_id: Option<String>,
    pub client_order_id: Uuid,
    pub instrument: Instrument,
    pub side: Side,
    pub requested_amount: f64,
    pub filled_amount: f64,
    pub avg_price: f64,
    pub cost: f64,
    pub fee_paid: f64,
    pub venue_timestamp: DateTime<Utc>,
    pub outcome: OrderOutcome,
    pub error_detail: Option<String>,
}

impl OrderResult {
    pub fn fill_percent(&self, requested: f64) -> f64 {
        if requested <= 0.0 {
            return 0.0;
        }
        (self.filled_amount / requested) * 100.0
    }
}

/// Live balance hold. Stale after 60s (see gateway::reservation).
#[derive(Debug, Clone)]
pub struct BalanceReservation {
    pub trade_key: String,
    pub venue: VenueId,
    pub currency: String,
    pub amount: f64,
    pub created_at: std::time::Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TradeStatus {
    Pending,
    BuyExecuted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLedgerEntry {
    pub trade_key: String,
    pub opportunity: Opportunity,
    pub status: TradeStatus,
    pub buy_result: Option<OrderResult>,
    pub sell_result: Option<OrderResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on failure for operator visibility (e.g. partial-fill / post-buy
    /// sell failure messages). Not part of the wire spec but carried through
    /// so recovery and logs can surface *why* a trade failed.
    pub failure_reason: Option<String>,
}

impl TradeLedgerEntry {
    pub fn new(opportunity: Opportunity, now: DateTime<Utc>) -> Self {
        Self {
            trade_key: opportunity.trade_key(),
            opportunity,
            status: TradeStatus::Pending,
            buy_result: None,
            sell_result: None,
            started_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_splits_base_quote() {
        let i = Instrument::new("BTC/USD");
        assert_eq!(i.base(), "BTC");
        assert_eq!(i.quote(), "USD");
    }

    #[test]
    fn trade_key_is_stable() {
        let i = Instrument::new("BTC/USD");
        let a = VenueId::new("alpha");
        let b = VenueId::new("beta");
        assert_eq!(trade_key(&i, &a, &b), "BTC/USD-alpha-beta");
    }

    #[test]
    fn slippage_walks_levels() {
        let book = OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![
                PriceLevel { price: 100.0, amount: 5.0 },
                PriceLevel { price: 101.0, amount: 5.0 },
            ],
            bids: vec![],
            venue_timestamp: Utc::now(),
            local_receive_timestamp: Utc::now(),
        };
        let slip = book.slippage_for(Side::Buy, 8.0).unwrap();
        // 5 @ 100 + 3 @ 101 => vwap = (500 + 303) / 8 = 100.375, vs best 100 => 0.375%
        assert!((slip - 0.00375).abs() < 1e-6);
    }

    #[test]
    fn slippage_none_when_book_too_thin() {
        let book = OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![PriceLevel { price: 100.0, amount: 1.0 }],
            bids: vec![],
            venue_timestamp: Utc::now(),
            local_receive_timestamp: Utc::now(),
        };
        assert!(book.slippage_for(Side::Buy, 10.0).is_none());
    }
}
