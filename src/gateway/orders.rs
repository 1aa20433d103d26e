//! `recentOrders` idempotency cache and the `executeTrade` sequence, see
//! spec.md §4.3 "Order submission".
//!
//! Grounded in the teacher's `vault::trade_executor::TradeExecutor::execute`
//! flow (submit, classify the failure, decide whether to retry) generalized
//! to the spec's idempotency-first, no-internal-retry contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::errors::EngineError;
use crate::rate_limiter::{looks_like_throttle, RateLimiter};
use crate::types::{Instrument, OrderRequest, OrderResult, Side, VenueId};

use super::driver::VenueDriver;

const RECENT_ORDER_TTL: Duration = Duration::from_secs(60);
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timedout", "etimedout"];
const TIMEOUT_RECOVERY_SLEEP: Duration = Duration::from_secs(2);
const TIMEOUT_RECOVERY_WINDOW: chrono::Duration = chrono::Duration::seconds(30);
const TIMEOUT_RECOVERY_AMOUNT_TOLERANCE: f64 = 0.01;

fn looks_like_timeout(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIMEOUT_MARKERS.iter().any(|m| lower.contains(m))
}

struct RecentOrderEntry {
    venue_order_id: String,
    instrument: Instrument,
    recorded_at: Instant,
}

/// The only place in the gateway that parses venue error text, see spec.md §9.
#[derive(Default)]
pub struct RecentOrders {
    entries: parking_lot::Mutex<HashMap<uuid::Uuid, RecentOrderEntry>>,
}

impl RecentOrders {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, client_order_id: uuid::Uuid) -> Option<(String, Instrument)> {
        let mut guard = self.entries.lock();
        guard.retain(|_, e| e.recorded_at.elapsed() < RECENT_ORDER_TTL);
        guard
            .get(&client_order_id)
            .map(|e| (e.venue_order_id.clone(), e.instrument.clone()))
    }

    fn record(&self, client_order_id: uuid::Uuid, venue_order_id: String, instrument: Instrument) {
        let mut guard = self.entries.lock();
        guard.retain(|_, e| e.recorded_at.elapsed() < RECENT_ORDER_TTL);
        guard.insert(
            client_order_id,
            RecentOrderEntry { venue_order_id, instrument, recorded_at: Instant::now() },
        );
    }
}

/// Runs the §4.3 `executeTrade` sequence exactly once (no internal retry;
/// idempotency is handled entirely by step 2 below).
pub async fn execute_trade(
    driver: &dyn VenueDriver,
    venue: &VenueId,
    limiter: &RateLimiter,
    recent_orders: &RecentOrders,
    req: OrderRequest,
) -> Result<OrderResult, EngineError> {
    // Step 2: idempotency short-circuit.
    if let Some((venue_order_id, instrument)) = recent_orders.lookup(req.client_order_id) {
        match driver.fetch_order(&venue_order_id, &instrument).await {
            Ok(result) => return Ok(result),
            Err(e) => warn!(
                client_order_id = %req.client_order_id,
                error = %e,
                "recentOrders hit but fetch_order failed, falling through to a fresh submission"
            ),
        }
    }

    // Step 3: rate-limit gate.
    limiter.acquire(venue).await;

    // Step 4: submit.
    match driver.create_order(&req).await {
        Ok(result) => {
            // Step 7.
            if let Some(venue_order_id) = &result.venue_order_id {
                recent_orders.record(req.client_order_id, venue_order_id.clone(), req.instrument.clone());
            }
            limiter.on_success(venue);
            Ok(result)
        }
        Err(e) => handle_submission_error(driver, venue, limiter, recent_orders, &req, e).await,
    }
}

async fn handle_submission_error(
    driver: &dyn VenueDriver,
    venue: &VenueId,
    limiter: &RateLimiter,
    recent_orders: &RecentOrders,
    req: &OrderRequest,
    error: EngineError,
) -> Result<OrderResult, EngineError> {
    let message = error.to_string();

    // Step 5: timeout recovery via scanning recent venue orders.
    if looks_like_timeout(&message) {
        tokio::time::sleep(TIMEOUT_RECOVERY_SLEEP).await;
        match driver.fetch_recent_orders(&req.instrument, 10).await {
            Ok(candidates) => {
                if let Some(found) = find_matching_recent_order(&candidates, req) {
                    recent_orders.record(
                        req.client_order_id,
                        found.venue_order_id.clone().unwrap_or_default(),
                        req.instrument.clone(),
                    );
                    info!(
                        client_order_id = %req.client_order_id,
                        venue = %venue,
                        "recovered order identity after a submission timeout"
                    );
                    return Ok(found);
                }
                Err(error)
            }
            Err(scan_err) => {
                warn!(error = %scan_err, "timeout recovery scan itself failed");
                Err(error)
            }
        }
    // Step 6: throttle classification.
    } else if looks_like_throttle(&message) {
        limiter.on_throttled(venue);
        Err(error)
    } else {
        Err(error)
    }
}

/// An order created within the last 30s matching (side, amount within 1%).
fn find_matching_recent_order(candidates: &[OrderResult], req: &OrderRequest) -> Option<OrderResult> {
    let now = chrono::Utc::now();
    candidates
        .iter()
        .filter(|c| c.side == req.side)
        .filter(|c| now.signed_duration_since(c.venue_timestamp) <= TIMEOUT_RECOVERY_WINDOW)
        .filter(|c| now.signed_duration_since(c.venue_timestamp) >= chrono::Duration::zero())
        .find(|c| within_tolerance(c.requested_amount, req.amount))
        .cloned()
}

fn within_tolerance(a: f64, b: f64) -> bool {
    if b == 0.0 {
        return a == 0.0;
    }
    ((a - b) / b).abs() <= TIMEOUT_RECOVERY_AMOUNT_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderOutcome;

    fn order_result(side: Side, requested: f64, ts: chrono::DateTime<chrono::Utc>) -> OrderResult {
        OrderResult {
            venue: VenueId::new("alpha"),
            venue_order_id: Some("v-1".to_string()),
            client_order_id: uuid::Uuid::new_v4(),
            instrument: Instrument::new("BTC/USD"),
            side,
            requested_amount: requested,
            filled_amount: requested,
            avg_price: 100.0,
            cost: requested * 100.0,
            fee_paid: 0.1,
            venue_timestamp: ts,
            outcome: OrderOutcome::Success,
            error_detail: None,
        }
    }

    #[test]
    fn timeout_markers_are_detected() {
        assert!(looks_like_timeout("connect ETIMEDOUT"));
        assert!(looks_like_timeout("Request timeout"));
        assert!(!looks_like_timeout("insufficient funds"));
    }

    #[test]
    fn matches_order_within_amount_tolerance_and_window() {
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 10.0);
        let candidates = vec![order_result(Side::Buy, 10.05, chrono::Utc::now())];
        assert!(find_matching_recent_order(&candidates, &req).is_some());
    }

    #[test]
    fn rejects_order_outside_amount_tolerance() {
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 10.0);
        let candidates = vec![order_result(Side::Buy, 11.0, chrono::Utc::now())];
        assert!(find_matching_recent_order(&candidates, &req).is_none());
    }

    #[test]
    fn rejects_order_outside_time_window() {
        let req = OrderRequest::market(VenueId::new("alpha"), Instrument::new("BTC/USD"), Side::Buy, 10.0);
        let old = chrono::Utc::now() - chrono::Duration::seconds(60);
        let candidates = vec![order_result(Side::Buy, 10.0, old)];
        assert!(find_matching_recent_order(&candidates, &req).is_none());
    }
}
