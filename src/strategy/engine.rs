//! Arbitrage Strategy Engine (C4): detection, arbitration, sequenced two-leg
//! execution. See spec.md §4.4.
//!
//! Lifecycle and per-tick scan loop are grounded in the teacher's
//! `ArbitrageEngine::scan_opportunities`/`validate_and_enhance_opportunity`;
//! the sequenced buy-then-sell execution with ledger bookkeeping is
//! grounded in `vault::trade_executor::TradeExecutor::execute`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};

use crate::config::StrategyConfig;
use crate::events::StrategyEvent;
use crate::gateway::VenueDriverRegistry;
use crate::ledger::TradeStateLedger;
use crate::rate_limiter::RateLimiter;
use crate::types::{Instrument, OrderBookSnapshot, OrderRequest, Opportunity, Side, VenueId};

use super::opportunity::{candidate_opportunity, validate_opportunity};
use super::variance::{VarianceHistory, VarianceSample, VarianceTelemetry};

const MAX_AGE: chrono::Duration = chrono::Duration::seconds(5);

pub struct ArbitrageStrategyEngine {
    registry: Arc<VenueDriverRegistry>,
    ledger: Arc<TradeStateLedger>,
    limiter: Arc<RateLimiter>,
    config: StrategyConfig,
    max_concurrent_trades: usize,
    instruments: Vec<Instrument>,
    order_book_depth: u32,

    active_trades: Mutex<HashSet<String>>,
    latest_books: RwLock<HashMap<(VenueId, Instrument), OrderBookSnapshot>>,
    variance_history: Mutex<VarianceHistory>,

    events: broadcast::Sender<StrategyEvent>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    in_flight: tokio::sync::Semaphore,
}

impl ArbitrageStrategyEngine {
    pub fn new(
        registry: Arc<VenueDriverRegistry>,
        ledger: Arc<TradeStateLedger>,
        limiter: Arc<RateLimiter>,
        config: StrategyConfig,
        max_concurrent_trades: usize,
        instruments: Vec<Instrument>,
        order_book_depth: usize,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            ledger,
            limiter,
            config,
            max_concurrent_trades,
            instruments,
            order_book_depth: order_book_depth as u32,
            active_trades: Mutex::new(HashSet::new()),
            latest_books: RwLock::new(HashMap::new()),
            variance_history: Mutex::new(VarianceHistory::new()),
            events,
            stop_tx,
            stop_rx,
            // A generous cap on concurrently-spawned execute() tasks; the
            // tradeKey reservation in active_trades is the real arbitration
            // fence, this just bounds total parallelism.
            in_flight: tokio::sync::Semaphore::new(64),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StrategyEvent> {
        self.events.subscribe()
    }

    pub fn active_trade_count(&self) -> usize {
        self.active_trades.lock().len()
    }

    pub fn variance_telemetry(&self) -> VarianceTelemetry {
        self.variance_history.lock().telemetry()
    }

    /// Subscribes every configured instrument on every registered venue and
    /// starts the monitoring tick.
    pub fn start(self: &Arc<Self>) {
        for instrument in &self.instruments {
            for handle in self.registry.handles() {
                let (tx, mut rx) = tokio::sync::mpsc::channel(64);
                let handle = Arc::clone(handle);
                let instrument_clone = instrument.clone();
                let depth = self.order_book_depth;
                tokio::spawn(async move {
                    handle.subscribe(instrument_clone, depth, tx).await;
                });

                let engine = Arc::clone(self);
                let venue = handle.venue.clone();
                let instrument_for_loop = instrument.clone();
                tokio::spawn(async move {
                    while let Some(snapshot) = rx.recv().await {
                        engine
                            .latest_books
                            .write()
                            .insert((venue.clone(), instrument_for_loop.clone()), snapshot);
                    }
                });
            }
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_monitoring_loop().await;
        });
    }

    async fn run_monitoring_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.check_interval);
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let instruments = self.instruments.clone();
                    for instrument in instruments {
                        self.scan_instrument(&instrument).await;
                    }
                    let _ = self.events.send(StrategyEvent::StatusUpdate {
                        message: format!(
                            "tick complete: {} active trade(s) across {} instrument(s)",
                            self.active_trade_count(),
                            self.instruments.len()
                        ),
                    });
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Stops the tick, waits up to `trade_settle_drain` for in-flight trades
    /// to clear, and warns about anything still active.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let deadline = tokio::time::Instant::now() + self.config.trade_settle_drain;
        while tokio::time::Instant::now() < deadline {
            if self.active_trades.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining: Vec<String> = self.active_trades.lock().iter().cloned().collect();
        if !remaining.is_empty() {
            warn!(count = remaining.len(), trades = ?remaining, "shutdown drain elapsed with trades still active");
        }
    }

    async fn scan_instrument(self: &Arc<Self>, instrument: &Instrument) {
        let all_venues: Vec<(VenueId, OrderBookSnapshot)> = {
            let books = self.latest_books.read();
            books
                .iter()
                .filter(|((_, i), _)| i == instrument)
                .map(|((v, _), b)| (v.clone(), b.clone()))
                .collect()
        };
        if all_venues.len() < 2 {
            return;
        }

        let now = Utc::now();
        let mut venues = Vec::with_capacity(all_venues.len());
        for (venue, book) in all_venues {
            let Some(handle) = self.registry.get(&venue) else { continue };
            if handle.is_stale(&book, now) {
                let age_ms = now.signed_duration_since(book.venue_timestamp).num_milliseconds();
                let err = crate::errors::EngineError::Staleness {
                    instrument: instrument.to_string(),
                    venue: venue.to_string(),
                    age_ms,
                    threshold_ms: handle.staleness_threshold().as_millis() as i64,
                };
                warn!(error = %err, "skipping stale order book");
                continue;
            }
            venues.push((venue, book));
        }
        if venues.len() < 2 {
            return;
        }

        let mut candidates = Vec::new();
        for (buy_venue, buy_book) in &venues {
            for (sell_venue, sell_book) in &venues {
                if buy_venue == sell_venue {
                    continue;
                }
                let Some(buy_handle) = self.registry.get(buy_venue) else { continue };
                let Some(sell_handle) = self.registry.get(sell_venue) else { continue };
                let buy_fees = buy_handle.cached_fees(instrument);
                let sell_fees = sell_handle.cached_fees(instrument);
                if let Some(opp) = candidate_opportunity(
                    instrument,
                    buy_venue,
                    sell_venue,
                    buy_book,
                    sell_book,
                    self.config.max_trade_amount,
                    buy_fees,
                    sell_fees,
                ) {
                    if opp.sell_price > opp.buy_price && opp.profit_percent >= self.config.min_profit_percent {
                        candidates.push(opp);
                    }
                }
            }
        }

        candidates.sort_by(|a, b| b.profit_percent.partial_cmp(&a.profit_percent).unwrap_or(std::cmp::Ordering::Equal));

        for opportunity in candidates {
            if self.should_execute(&opportunity).await {
                let _ = self.events.send(StrategyEvent::OpportunityFound {
                    trade_key: opportunity.trade_key(),
                    profit_percent: opportunity.profit_percent,
                });
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    let _permit = engine.in_flight.acquire().await;
                    engine.execute(opportunity).await;
                });
            }
        }
    }

    /// Gating sequence, short-circuiting on any failure. See spec.md §4.4.
    async fn should_execute(&self, opportunity: &Opportunity) -> bool {
        // 1. Global concurrency cap.
        if self.active_trades.lock().len() >= self.max_concurrent_trades {
            return false;
        }

        // 2. Age / sanity validation.
        if let Err(failure) = validate_opportunity(opportunity, Utc::now(), MAX_AGE, self.config.min_trade_amount) {
            warn!(trade_key = %opportunity.trade_key(), ?failure, "opportunity rejected at validation");
            return false;
        }

        let trade_key = opportunity.trade_key();

        // 3. Atomic tradeKey lock: synchronous check-and-insert, no await in
        // between. THE race-condition fence between competing ticks.
        {
            let mut active = self.active_trades.lock();
            if active.contains(&trade_key) {
                return false;
            }
            active.insert(trade_key.clone());
        }

        // 4. Balance check.
        if !self.check_balances(opportunity, &trade_key).await {
            self.active_trades.lock().remove(&trade_key);
            return false;
        }

        // 5. Fresh-price / slippage validation.
        if !self.validate_current_prices(opportunity, &trade_key).await {
            self.active_trades.lock().remove(&trade_key);
            return false;
        }

        true
    }

    async fn check_balances(&self, opportunity: &Opportunity, trade_key: &str) -> bool {
        let Ok(buy_handle) = self.registry.require(&opportunity.buy_venue) else { return false };
        let Ok(sell_handle) = self.registry.require(&opportunity.sell_venue) else { return false };
        let (base, quote) = opportunity.instrument.base_quote();

        let required_quote = opportunity.amount * opportunity.buy_price * (1.0 + self.config.reserve_percent);
        let required_base = opportunity.amount;

        let available_quote = match buy_handle.available_balance(quote, Some(trade_key)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(trade_key, error = %e, "balance fetch failed on buy leg");
                return false;
            }
        };
        let available_base = match sell_handle.available_balance(base, Some(trade_key)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(trade_key, error = %e, "balance fetch failed on sell leg");
                return false;
            }
        };

        available_quote >= required_quote && available_base >= required_base
    }

    async fn validate_current_prices(&self, opportunity: &Opportunity, trade_key: &str) -> bool {
        let Ok(buy_handle) = self.registry.require(&opportunity.buy_venue) else { return false };
        let Ok(sell_handle) = self.registry.require(&opportunity.sell_venue) else { return false };

        let buy_book = match buy_handle.fetch_order_book(&opportunity.instrument, self.order_book_depth).await {
            Ok(b) => b,
            Err(e) => {
                warn!(trade_key, error = %e, "fresh book fetch failed on buy leg");
                return false;
            }
        };
        let sell_book = match sell_handle.fetch_order_book(&opportunity.instrument, self.order_book_depth).await {
            Ok(b) => b,
            Err(e) => {
                warn!(trade_key, error = %e, "fresh book fetch failed on sell leg");
                return false;
            }
        };

        let Some(current_buy) = buy_book.best_ask() else { return false };
        let Some(current_sell) = sell_book.best_bid() else { return false };

        let buy_variance = (current_buy.price - opportunity.buy_price) / opportunity.buy_price * 100.0;
        let sell_variance = (opportunity.sell_price - current_sell.price) / opportunity.sell_price * 100.0;
        let total_variance = buy_variance.abs() + sell_variance.abs();

        let mut accepted = buy_variance <= self.config.price_tolerance_percent
            && sell_variance <= self.config.price_tolerance_percent;

        if accepted && self.config.dynamic_tolerance_enabled && total_variance > 0.0 {
            let erosion = (total_variance / opportunity.profit_percent) * 100.0;
            accepted = erosion <= self.config.max_profit_erosion_percent;
        }

        let buy_slippage = buy_book.slippage_for(Side::Buy, opportunity.amount).unwrap_or(f64::MAX);
        let sell_slippage = sell_book.slippage_for(Side::Sell, opportunity.amount).unwrap_or(f64::MAX);
        if buy_slippage > self.config.max_slippage || sell_slippage > self.config.max_slippage {
            accepted = false;
        }

        self.variance_history.lock().record(VarianceSample {
            buy_variance_percent: buy_variance,
            sell_variance_percent: sell_variance,
            profit_impact_percent: total_variance,
            accepted,
        });

        accepted
    }

    /// Holds the tradeKey reservation for its duration; always releases it
    /// and any balance reservations before returning. See spec.md §4.4.
    async fn execute(&self, opportunity: Opportunity) {
        let trade_key = opportunity.trade_key();
        let result = self.execute_inner(&opportunity, &trade_key).await;
        if let Err(e) = &result {
            error!(trade_key = %trade_key, error = %e, "execute() aborted");
        }

        if let Ok(buy_handle) = self.registry.require(&opportunity.buy_venue) {
            buy_handle.reservations.release(&trade_key);
        }
        if let Ok(sell_handle) = self.registry.require(&opportunity.sell_venue) {
            sell_handle.reservations.release(&trade_key);
        }
        self.active_trades.lock().remove(&trade_key);

        let _ = self.events.send(StrategyEvent::ExecutionCompleted {
            trade_key,
            success: result.is_ok(),
            actual_profit: result.ok(),
        });
    }

    async fn execute_inner(&self, opportunity: &Opportunity, trade_key: &str) -> Result<f64, crate::errors::EngineError> {
        let buy_handle = self.registry.require(&opportunity.buy_venue)?;
        let sell_handle = self.registry.require(&opportunity.sell_venue)?;
        let (base, quote) = opportunity.instrument.base_quote();

        // 1. Stale-data guard: re-verify balances with fresh fetches.
        if !self.check_balances(opportunity, trade_key).await {
            warn!(trade_key, "balance re-verification failed, aborting before any order is placed");
            return Err(crate::errors::EngineError::BalanceRace {
                venue: opportunity.buy_venue.to_string(),
                currency: quote.to_string(),
                needed: opportunity.amount * opportunity.buy_price,
                available: 0.0,
            });
        }

        // 2. Reserve both legs.
        let required_quote = opportunity.amount * opportunity.buy_price * (1.0 + self.config.reserve_percent);
        buy_handle.reservations.reserve(trade_key, &opportunity.buy_venue, quote, required_quote);
        sell_handle.reservations.reserve(trade_key, &opportunity.sell_venue, base, opportunity.amount);

        // 3. Record intent. A ledger write failure is fatal for this path.
        self.ledger.record_start(opportunity.clone())?;

        // 4. Fresh clientOrderIds, 5. submit buy first.
        let buy_req = OrderRequest::market(opportunity.buy_venue.clone(), opportunity.instrument.clone(), Side::Buy, opportunity.amount);
        let buy_result = match tokio::time::timeout(self.config.order_timeout, buy_handle.execute_trade(&self.limiter, buy_req)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.ledger.record_complete(trade_key, false, None, Some(format!("buy failed: {e}")))?;
                return Err(e);
            }
            Err(_) => {
                let e = crate::errors::EngineError::TransientVenue {
                    venue: opportunity.buy_venue.to_string(),
                    message: "buy leg timed out".to_string(),
                };
                self.ledger.record_complete(trade_key, false, None, Some("buy leg timed out".to_string()))?;
                return Err(e);
            }
        };

        // 6. Partial-fill gate.
        let fill_percent = buy_result.fill_percent(opportunity.amount);
        if fill_percent < self.config.partial_fill_threshold {
            let message = format!(
                "partial fill {fill_percent:.1}% below threshold {:.1}%; buy leg stranded, manual intervention may be required",
                self.config.partial_fill_threshold
            );
            error!(trade_key, message = %message);
            self.ledger.record_complete(trade_key, false, Some(buy_result.clone()), Some(message.clone()))?;
            return Err(crate::errors::EngineError::PartialFillRejected {
                trade_key: trade_key.to_string(),
                fill_percent,
                threshold: self.config.partial_fill_threshold,
            });
        }

        // 7. Adjust sell amount to the actual filled amount.
        let sell_amount = buy_result.filled_amount;

        // 8. Record buy leg.
        self.ledger.record_buy_executed(trade_key, buy_result.clone())?;

        // 9. Submit sell.
        let sell_req = OrderRequest::market(opportunity.sell_venue.clone(), opportunity.instrument.clone(), Side::Sell, sell_amount);
        let sell_result = match tokio::time::timeout(self.config.order_timeout, sell_handle.execute_trade(&self.limiter, sell_req)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(trade_key, error = %e, "buy succeeded but sell failed: position mismatch, operator attention required");
                self.ledger.record_complete(
                    trade_key,
                    false,
                    None,
                    Some(format!("POSITION MISMATCH: buy succeeded, sell failed: {e}")),
                )?;
                return Err(e);
            }
            Err(_) => {
                error!(trade_key, "buy succeeded but sell leg timed out: position mismatch, operator attention required");
                self.ledger.record_complete(
                    trade_key,
                    false,
                    None,
                    Some("POSITION MISMATCH: buy succeeded, sell leg timed out".to_string()),
                )?;
                return Err(crate::errors::EngineError::TransientVenue {
                    venue: opportunity.sell_venue.to_string(),
                    message: "sell leg timed out".to_string(),
                });
            }
        };

        let actual_profit = (sell_result.cost - sell_result.fee_paid) - (buy_result.cost + buy_result.fee_paid);
        self.ledger.record_complete(trade_key, true, Some(sell_result), None)?;
        Ok(actual_profit)
    }
}
