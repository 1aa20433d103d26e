//! Per-venue handle: connection state machine, subscription loop, balance
//! queries, and the fsync-free in-memory bits of C3. See spec.md §4.3.
//!
//! The state machine and backoff calculation are grounded in the teacher's
//! `scrapers::binance_session::{SessionState, BackoffCalculator}` -- same
//! shape (`connecting -> connected -> error -> reconnecting -> connecting`),
//! generalized from a WebSocket-specific 24h-refresh session to a
//! venue-agnostic handle with no hard connection lifetime.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::events::GatewayEvent;
use crate::gateway::driver::{normalize_depth, VenueDriver};
use crate::gateway::fees::FeeCache;
use crate::gateway::orders::{execute_trade, RecentOrders};
use crate::gateway::reservation::ReservationBook;
use crate::rate_limiter::RateLimiter;
use crate::types::{Instrument, OrderBookSnapshot, OrderRequest, OrderResult, TradingFees, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct HandleConfig {
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub staleness_threshold: Duration,
    pub stream_restart_delay: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            staleness_threshold: Duration::from_millis(500),
            stream_restart_delay: Duration::from_secs(1),
        }
    }
}

/// xorshift64 jitter, same construction as the teacher's `BackoffCalculator`.
struct Backoff {
    config: HandleConfig,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    fn new(config: HandleConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(12345),
        }
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.config.initial_reconnect_delay.as_secs_f64() * 2f64.powi(self.attempt as i32);
        let capped = base.min(self.config.max_reconnect_delay.as_secs_f64());
        self.attempt += 1;
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct HandleInner {
    state: RwLock<HandleState>,
    error_count: AtomicU32,
    last_update_ms: AtomicU64,
    backoff: parking_lot::Mutex<Backoff>,
}

/// One per configured venue. Owns the driver, the connection state machine,
/// the fee cache, reservations, and the recentOrders idempotency cache.
pub struct VenueHandle {
    pub venue: VenueId,
    driver: Arc<dyn VenueDriver>,
    config: HandleConfig,
    inner: HandleInner,
    pub fees: FeeCache,
    pub reservations: ReservationBook,
    recent_orders: RecentOrders,
    events: broadcast::Sender<GatewayEvent>,
}

impl VenueHandle {
    pub fn new(
        venue: VenueId,
        driver: Arc<dyn VenueDriver>,
        config: HandleConfig,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            venue,
            driver,
            inner: HandleInner {
                state: RwLock::new(HandleState::Connecting),
                error_count: AtomicU32::new(0),
                last_update_ms: AtomicU64::new(0),
                backoff: parking_lot::Mutex::new(Backoff::new(config.clone())),
            },
            config,
            fees: FeeCache::new(),
            reservations: ReservationBook::new(),
            recent_orders: RecentOrders::new(),
            events,
        }
    }

    pub fn state(&self) -> HandleState {
        *self.inner.state.read()
    }

    fn record_snapshot(&self, snapshot: &OrderBookSnapshot) {
        let ts_ms = snapshot.venue_timestamp.timestamp_millis().max(0) as u64;
        self.inner.last_update_ms.fetch_max(ts_ms, Ordering::Relaxed);
    }

    /// Whether `snapshot` is older than `stalenessThreshold` relative to now.
    pub fn is_stale(&self, snapshot: &OrderBookSnapshot, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(snapshot.venue_timestamp);
        age > chrono::Duration::from_std(self.config.staleness_threshold).unwrap_or_default()
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.config.staleness_threshold
    }

    pub async fn fetch_order_book(
        &self,
        instrument: &Instrument,
        depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError> {
        let (normalized, capped) = normalize_depth(self.driver.accepted_depths(), depth);
        if capped {
            warn!(venue = %self.venue, requested = depth, used = normalized, "requested depth exceeds venue maximum, capping");
        }
        self.driver.fetch_order_book(instrument, normalized).await
    }

    /// Starts the perpetual consume loop on the streaming source and
    /// forwards normalized snapshots on `sink`. Errors increment the error
    /// counter and drive the state machine per spec.md §4.3.
    pub async fn subscribe(
        self: &Arc<Self>,
        instrument: Instrument,
        depth: u32,
        sink: tokio::sync::mpsc::Sender<OrderBookSnapshot>,
    ) {
        let (normalized, capped) = normalize_depth(self.driver.accepted_depths(), depth);
        if capped {
            warn!(venue = %self.venue, requested = depth, used = normalized, "requested depth exceeds venue maximum, capping");
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match handle.driver.stream_order_book(&instrument, normalized).await {
                    Ok(mut rx) => {
                        *handle.inner.state.write() = HandleState::Connected;
                        handle.inner.error_count.store(0, Ordering::Relaxed);
                        handle.inner.backoff.lock().reset();
                        let _ = handle.events.send(GatewayEvent::VenueConnected { venue: handle.venue.clone() });

                        while let Some(update) = rx.recv().await {
                            match update {
                                Ok(snapshot) => {
                                    handle.record_snapshot(&snapshot);
                                    let _ = handle.events.send(GatewayEvent::OrderBookUpdate { snapshot: snapshot.clone() });
                                    if sink.send(snapshot).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    handle.on_stream_error(&e).await;
                                }
                            }
                        }
                        // Stream ended: treat like an error and reconnect.
                        handle
                            .on_stream_error(&EngineError::TransientVenue {
                                venue: handle.venue.to_string(),
                                message: "stream closed".to_string(),
                            })
                            .await;
                    }
                    Err(e) => {
                        handle.on_stream_error(&e).await;
                    }
                }

                if handle.state() == HandleState::Reconnecting {
                    let delay = handle.inner.backoff.lock().next_delay();
                    tokio::time::sleep(delay).await;
                } else {
                    tokio::time::sleep(handle.config.stream_restart_delay).await;
                }
            }
        });
    }

    async fn on_stream_error(&self, e: &EngineError) {
        let count = self.inner.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        error!(venue = %self.venue, error = %e, error_count = count, "stream error");
        let _ = self.events.send(GatewayEvent::VenueError { venue: self.venue.clone(), message: e.to_string() });
        if count >= self.config.max_reconnect_attempts {
            *self.inner.state.write() = HandleState::Reconnecting;
            let _ = self.events.send(GatewayEvent::VenueDisconnected { venue: self.venue.clone() });
        }
    }

    pub async fn fetch_balance(&self, currency: &str) -> Result<crate::gateway::driver::Balance, EngineError> {
        self.driver.fetch_balance(currency).await
    }

    /// `max(0, free - sum(live reservations))`.
    pub async fn available_balance(
        &self,
        currency: &str,
        excluding_trade_key: Option<&str>,
    ) -> Result<f64, EngineError> {
        let balance = self.driver.fetch_balance(currency).await?;
        Ok(self.reservations.available(&self.venue, currency, balance.free, excluding_trade_key))
    }

    pub async fn fetch_trading_fees(&self, instrument: Option<&Instrument>) -> Result<TradingFees, EngineError> {
        let fees = self.driver.fetch_trading_fees(instrument).await?;
        match instrument {
            Some(i) => self.fees.put_instrument(i.clone(), fees),
            None => self.fees.put_wildcard(fees),
        }
        Ok(fees)
    }

    pub fn cached_fees(&self, instrument: &Instrument) -> TradingFees {
        self.fees.lookup(instrument, Utc::now())
    }

    pub async fn execute_trade(
        &self,
        limiter: &RateLimiter,
        req: OrderRequest,
    ) -> Result<OrderResult, EngineError> {
        execute_trade(self.driver.as_ref(), &self.venue, limiter, &self.recent_orders, req).await
    }

    pub async fn cancel_all_open_orders(&self) -> Result<(), EngineError> {
        self.driver.cancel_all_open_orders().await
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.driver.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper_driver::PaperVenueDriver;

    fn handle() -> Arc<VenueHandle> {
        let (tx, _rx) = broadcast::channel(16);
        let driver = PaperVenueDriver::new(VenueId::new("alpha"));
        driver.seed_book(OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![crate::types::PriceLevel { price: 100.0, amount: 5.0 }],
            bids: vec![],
            venue_timestamp: Utc::now(),
            local_receive_timestamp: Utc::now(),
        });
        Arc::new(VenueHandle::new(VenueId::new("alpha"), Arc::new(driver), HandleConfig::default(), tx))
    }

    #[tokio::test]
    async fn fetch_order_book_normalizes_depth() {
        let h = handle();
        let book = h.fetch_order_book(&Instrument::new("BTC/USD"), 3).await.unwrap();
        assert_eq!(book.venue, VenueId::new("alpha"));
    }

    #[test]
    fn starts_in_connecting_state() {
        let h = handle();
        assert_eq!(h.state(), HandleState::Connecting);
    }

    #[test]
    fn staleness_check_flags_old_snapshots() {
        let h = handle();
        let snapshot = OrderBookSnapshot {
            venue: VenueId::new("alpha"),
            instrument: Instrument::new("BTC/USD"),
            asks: vec![],
            bids: vec![],
            venue_timestamp: Utc::now() - chrono::Duration::seconds(2),
            local_receive_timestamp: Utc::now(),
        };
        assert!(h.is_stale(&snapshot, Utc::now()));
    }
}
