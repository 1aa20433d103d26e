//! Balance reservation accounting, see spec.md §4.3 "Balance reservation".
//!
//! `balanceReservations` is owned exclusively by the gateway and swept
//! lazily before every read, same shape as the teacher's
//! `middleware::rate_limit` per-key map guarded by a single `parking_lot::Mutex`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::{BalanceReservation, VenueId};

const RESERVATION_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct ReservationBook {
    reservations: parking_lot::Mutex<Vec<BalanceReservation>>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, trade_key: &str, venue: &VenueId, currency: &str, amount: f64) {
        let mut guard = self.reservations.lock();
        sweep(&mut guard);
        guard.push(BalanceReservation {
            trade_key: trade_key.to_string(),
            venue: venue.clone(),
            currency: currency.to_string(),
            amount,
            created_at: Instant::now(),
        });
    }

    /// Removes every reservation keyed by `trade_key`.
    pub fn release(&self, trade_key: &str) {
        let mut guard = self.reservations.lock();
        guard.retain(|r| r.trade_key != trade_key);
    }

    /// `max(0, free - sum(live reservations for (venue, currency)))`.
    /// If `excluding_trade_key` is set, that trade's own reservations are not
    /// double-counted against it (spec.md §9 open question: the
    /// reservation-excluding-caller variant is authoritative).
    pub fn available(
        &self,
        venue: &VenueId,
        currency: &str,
        free: f64,
        excluding_trade_key: Option<&str>,
    ) -> f64 {
        let mut guard = self.reservations.lock();
        sweep(&mut guard);
        let reserved: f64 = guard
            .iter()
            .filter(|r| &r.venue == venue && r.currency == currency)
            .filter(|r| excluding_trade_key != Some(r.trade_key.as_str()))
            .map(|r| r.amount)
            .sum();
        (free - reserved).max(0.0)
    }

    pub fn active_count(&self) -> usize {
        let mut guard = self.reservations.lock();
        sweep(&mut guard);
        guard.len()
    }
}

fn sweep(reservations: &mut Vec<BalanceReservation>) {
    let now = Instant::now();
    reservations.retain(|r| now.saturating_duration_since(r.created_at) < RESERVATION_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_subtracts_live_reservations() {
        let book = ReservationBook::new();
        let venue = VenueId::new("alpha");
        book.reserve("trade-1", &venue, "USD", 300.0);
        assert_eq!(book.available(&venue, "USD", 1000.0, None), 700.0);
    }

    #[test]
    fn release_frees_the_full_amount() {
        let book = ReservationBook::new();
        let venue = VenueId::new("alpha");
        book.reserve("trade-1", &venue, "USD", 300.0);
        book.release("trade-1");
        assert_eq!(book.available(&venue, "USD", 1000.0, None), 1000.0);
    }

    #[test]
    fn excluding_trade_key_ignores_its_own_reservation() {
        let book = ReservationBook::new();
        let venue = VenueId::new("alpha");
        book.reserve("trade-1", &venue, "USD", 300.0);
        book.reserve("trade-2", &venue, "USD", 100.0);
        assert_eq!(book.available(&venue, "USD", 1000.0, Some("trade-1")), 900.0);
    }

    #[test]
    fn available_never_goes_negative() {
        let book = ReservationBook::new();
        let venue = VenueId::new("alpha");
        book.reserve("trade-1", &venue, "USD", 1500.0);
        assert_eq!(book.available(&venue, "USD", 1000.0, None), 0.0);
    }
}
