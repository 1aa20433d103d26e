//! In-memory `VenueDriver` used under `TEST_MODE`, see SPEC_FULL.md's
//! `VenueDriverRegistry` design decision.
//!
//! Grounded in the teacher's `vault::trade_executor` `dry_run` path and
//! `vault::paper_ledger`'s in-memory position accounting: orders fill
//! immediately at the requested price against a seeded book, balances are
//! tracked in a `HashMap`, nothing touches the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::errors::EngineError;
use crate::types::{
    Instrument, OrderBookSnapshot, OrderOutcome, OrderRequest, OrderResult, PriceLevel, Side,
    TradingFees, VenueId,
};

use super::driver::{Balance, BookUpdate, Capabilities, VenueDriver};

const ACCEPTED_DEPTHS: &[u32] = &[5, 10, 20, 50, 100];

struct PaperOrder {
    result: OrderResult,
}

pub struct PaperVenueDriver {
    venue: VenueId,
    books: RwLock<HashMap<Instrument, OrderBookSnapshot>>,
    balances: RwLock<HashMap<String, f64>>,
    orders: RwLock<Vec<PaperOrder>>,
    order_seq: AtomicU64,
    fill_ratio: f64,
    fail_orders: std::sync::atomic::AtomicBool,
    timeout_once: std::sync::atomic::AtomicBool,
}

impl PaperVenueDriver {
    pub fn new(venue: VenueId) -> Self {
        Self {
            venue,
            books: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            orders: RwLock::new(Vec::new()),
            order_seq: AtomicU64::new(0),
            fill_ratio: 1.0,
            fail_orders: std::sync::atomic::AtomicBool::new(false),
            timeout_once: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Test/bootstrap seam: install a book snapshot this driver will return
    /// from `fetch_order_book` until replaced.
    pub fn seed_book(&self, snapshot: OrderBookSnapshot) {
        self.books.write().insert(snapshot.instrument.clone(), snapshot);
    }

    pub fn seed_balance(&self, currency: impl Into<String>, amount: f64) {
        self.balances.write().insert(currency.into(), amount);
    }

    /// Fraction of the requested amount that fills, simulating partial
    /// fills for the S4/S5 scenarios in spec.md §8.
    pub fn with_fill_ratio(mut self, ratio: f64) -> Self {
        self.fill_ratio = ratio;
        self
    }

    /// Test seam for the S3 scenario: every subsequent `create_order` call
    /// returns a permanent venue error instead of filling.
    pub fn with_order_failures(self) -> Self {
        self.fail_orders.store(true, Ordering::Relaxed);
        self
    }

    /// Test seam for the S6 scenario: the first `create_order` call fills
    /// normally venue-side (so `fetch_recent_orders` can find it) but
    /// reports back as a client-side timeout, simulating a response that
    /// never reached the caller. Every call after the first behaves normally.
    pub fn with_timeout_once(self) -> Self {
        self.timeout_once.store(true, Ordering::Relaxed);
        self
    }
}

#[async_trait]
impl VenueDriver for PaperVenueDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities::STREAM_ORDER_BOOK
            | Capabilities::FETCH_BALANCE
            | Capabilities::CREATE_ORDER
            | Capabilities::CANCEL_ORDER
            | Capabilities::FETCH_TRADING_FEES
    }

    fn accepted_depths(&self) -> &[u32] {
        ACCEPTED_DEPTHS
    }

    async fn load_instruments(&self) -> Result<Vec<Instrument>, EngineError> {
        Ok(self.books.read().keys().cloned().collect())
    }

    async fn fetch_order_book(&self, instrument: &Instrument, _depth: u32) -> Result<OrderBookSnapshot, EngineError> {
        self.books
            .read()
            .get(instrument)
            .cloned()
            .map(|mut b| {
                b.local_receive_timestamp = Utc::now();
                b
            })
            .ok_or_else(|| EngineError::PermanentVenue {
                venue: self.venue.to_string(),
                message: format!("no seeded book for {instrument}"),
            })
    }

    async fn stream_order_book(
        &self,
        instrument: &Instrument,
        _depth: u32,
    ) -> Result<tokio::sync::mpsc::Receiver<BookUpdate>, EngineError> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        if let Some(book) = self.books.read().get(instrument).cloned() {
            let _ = tx.try_send(Ok(book));
        }
        Ok(rx)
    }

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, EngineError> {
        let free = self.balances.read().get(currency).copied().unwrap_or(0.0);
        Ok(Balance { currency: currency.to_string(), free, locked: 0.0 })
    }

    async fn fetch_trading_fees(&self, _instrument: Option<&Instrument>) -> Result<TradingFees, EngineError> {
        Ok(TradingFees { maker_rate: 0.001, taker_rate: 0.001, percentage_flag: true, last_refreshed: Utc::now() })
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderResult, EngineError> {
        if self.fail_orders.load(Ordering::Relaxed) {
            return Err(EngineError::PermanentVenue {
                venue: self.venue.to_string(),
                message: "order rejected".to_string(),
            });
        }

        let book = self.books.read().get(&req.instrument).cloned();
        let best = book.as_ref().and_then(|b| match req.side {
            Side::Buy => b.best_ask(),
            Side::Sell => b.best_bid(),
        });
        let price: PriceLevel = match best {
            Some(p) => p,
            None => {
                return Ok(OrderResult {
                    venue: self.venue.clone(),
                    venue_order_id: None,
                    client_order_id: req.client_order_id,
                    instrument: req.instrument.clone(),
                    side: req.side,
                    requested_amount: req.amount,
                    filled_amount: 0.0,
                    avg_price: 0.0,
                    cost: 0.0,
                    fee_paid: 0.0,
                    venue_timestamp: Utc::now(),
                    outcome: OrderOutcome::Failure,
                    error_detail: Some("no book seeded for instrument".to_string()),
                });
            }
        };

        let filled = req.amount * self.fill_ratio;
        let cost = filled * price.price;
        let fee = cost * 0.001;
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let venue_order_id = format!("paper-{}-{seq}", self.venue);

        let result = OrderResult {
            venue: self.venue.clone(),
            venue_order_id: Some(venue_order_id),
            client_order_id: req.client_order_id,
            instrument: req.instrument.clone(),
            side: req.side,
            requested_amount: req.amount,
            filled_amount: filled,
            avg_price: price.price,
            cost,
            fee_paid: fee,
            venue_timestamp: Utc::now(),
            outcome: OrderOutcome::Success,
            error_detail: None,
        };
        self.orders.write().push(PaperOrder { result: result.clone() });

        if self.timeout_once.swap(false, Ordering::Relaxed) {
            return Err(EngineError::TransientVenue {
                venue: self.venue.to_string(),
                message: "ETIMEDOUT waiting for order ack".to_string(),
            });
        }

        Ok(result)
    }

    async fn fetch_order(&self, venue_order_id: &str, _instrument: &Instrument) -> Result<OrderResult, EngineError> {
        self.orders
            .read()
            .iter()
            .find(|o| o.result.venue_order_id.as_deref() == Some(venue_order_id))
            .map(|o| o.result.clone())
            .ok_or_else(|| EngineError::PermanentVenue {
                venue: self.venue.to_string(),
                message: format!("unknown order id {venue_order_id}"),
            })
    }

    async fn fetch_recent_orders(&self, instrument: &Instrument, limit: u32) -> Result<Vec<OrderResult>, EngineError> {
        Ok(self
            .orders
            .read()
            .iter()
            .rev()
            .filter(|o| &o.result.instrument == instrument)
            .take(limit as usize)
            .map(|o| o.result.clone())
            .collect())
    }

    async fn cancel_order(&self, _venue_order_id: &str, _instrument: &Instrument) -> Result<(), EngineError> {
        Ok(())
    }

    async fn cancel_all_open_orders(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_driver() -> PaperVenueDriver {
        let driver = PaperVenueDriver::new(VenueId::new("alpha"));
        driver.seed_book(OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![PriceLevel { price: 100.0, amount: 10.0 }],
            bids: vec![PriceLevel { price: 99.0, amount: 10.0 }],
            venue_timestamp: Utc::now(),
            local_receive_timestamp: Utc::now(),
        });
        driver.seed_balance("USD", 10_000.0);
        driver
    }

    #[tokio::test]
    async fn create_order_fills_at_best_price() {
        let driver = seeded_driver();
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 5.0);
        let result = driver.create_order(&req).await.unwrap();
        assert_eq!(result.outcome, OrderOutcome::Success);
        assert_eq!(result.avg_price, 100.0);
        assert_eq!(result.filled_amount, 5.0);
    }

    #[tokio::test]
    async fn fetch_order_returns_the_recorded_fill() {
        let driver = seeded_driver();
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 5.0);
        let result = driver.create_order(&req).await.unwrap();
        let fetched = driver.fetch_order(result.venue_order_id.as_deref().unwrap(), &req.instrument).await.unwrap();
        assert_eq!(fetched.client_order_id, req.client_order_id);
    }

    #[tokio::test]
    async fn partial_fill_ratio_reduces_filled_amount() {
        let driver = PaperVenueDriver::new(VenueId::new("alpha")).with_fill_ratio(0.8);
        driver.seed_book(OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![PriceLevel { price: 100.0, amount: 10.0 }],
            bids: vec![],
            venue_timestamp: Utc::now(),
            local_receive_timestamp: Utc::now(),
        });
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 10.0);
        let result = driver.create_order(&req).await.unwrap();
        assert_eq!(result.filled_amount, 8.0);
    }

    #[tokio::test]
    async fn with_order_failures_rejects_every_order() {
        let driver = seeded_driver().with_order_failures();
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 5.0);
        assert!(driver.create_order(&req).await.is_err());
    }

    #[tokio::test]
    async fn with_timeout_once_fills_venue_side_but_errors_once() {
        let driver = seeded_driver().with_timeout_once();
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 5.0);
        assert!(driver.create_order(&req).await.is_err());
        assert_eq!(driver.orders.read().len(), 1);

        let req2 = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 5.0);
        assert!(driver.create_order(&req2).await.is_ok());
    }
}
