//! Opportunity detection and profit/fee arithmetic, see spec.md §4.4
//! "Per-tick scan" and §8 boundaries (`calculateProfitPercent`).
//!
//! Grounded in the teacher's `arbitrage::fees::FeeCalculator::{calculate_total_fees,
//! calculate_net_profit, is_profitable}`, generalized from the teacher's flat
//! percentage-fee model to the per-venue `TradingFees` cache.

use chrono::{DateTime, Utc};

use crate::types::{FeeBreakdown, Instrument, OrderBookSnapshot, Opportunity, TradingFees, VenueId};

/// Returns 0 for any non-positive `buy_price`, per spec.md §8 boundary.
pub fn profit_percent(buy_price: f64, sell_price: f64, buy_fee_rate: f64, sell_fee_rate: f64) -> f64 {
    if buy_price <= 0.0 {
        return 0.0;
    }
    let gross = (sell_price - buy_price) / buy_price;
    let fees = buy_fee_rate + sell_fee_rate;
    (gross - fees) * 100.0
}

/// Builds a candidate `Opportunity` for one directed venue pair, or `None`
/// if either side has no liquidity.
#[allow(clippy::too_many_arguments)]
pub fn candidate_opportunity(
    instrument: &Instrument,
    buy_venue: &VenueId,
    sell_venue: &VenueId,
    buy_book: &OrderBookSnapshot,
    sell_book: &OrderBookSnapshot,
    max_trade_amount: f64,
    buy_fees: TradingFees,
    sell_fees: TradingFees,
) -> Option<Opportunity> {
    let ask = buy_book.best_ask()?;
    let bid = sell_book.best_bid()?;
    let amount = ask.amount.min(bid.amount).min(max_trade_amount);
    if amount <= 0.0 {
        return None;
    }

    let buy_fee = ask.price * amount * buy_fees.taker_rate;
    let sell_fee = bid.price * amount * sell_fees.taker_rate;
    let profit_amount = (bid.price - ask.price) * amount - buy_fee - sell_fee;
    let percent = profit_percent(ask.price, bid.price, buy_fees.taker_rate, sell_fees.taker_rate);

    Some(Opportunity {
        instrument: instrument.clone(),
        buy_venue: buy_venue.clone(),
        sell_venue: sell_venue.clone(),
        buy_price: ask.price,
        sell_price: bid.price,
        amount,
        profit_percent: percent,
        profit_amount,
        timestamp: buy_book.venue_timestamp.min(sell_book.venue_timestamp),
        fees: FeeBreakdown { buy_fee, sell_fee, total: buy_fee + sell_fee },
    })
}

#[derive(Debug)]
pub enum ValidationFailure {
    TooOld { age_ms: i64, max_age_ms: i64 },
    FutureTimestamp { age_ms: i64 },
    NonPositive,
    BelowMinAmount { amount: f64, minimum: f64 },
}

/// Reject if `age > max_age`, `age < 0` (severe clock skew), or any of
/// profit/amount/prices are non-positive, or amount below the instrument
/// minimum. See spec.md §4.4 `validateOpportunity`.
pub fn validate_opportunity(
    opportunity: &Opportunity,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
    min_trade_amount: f64,
) -> Result<(), ValidationFailure> {
    let age = now.signed_duration_since(opportunity.timestamp);
    if age < chrono::Duration::zero() {
        return Err(ValidationFailure::FutureTimestamp { age_ms: age.num_milliseconds() });
    }
    if age > max_age {
        return Err(ValidationFailure::TooOld { age_ms: age.num_milliseconds(), max_age_ms: max_age.num_milliseconds() });
    }
    if opportunity.profit_amount <= 0.0 || opportunity.amount <= 0.0 || opportunity.buy_price <= 0.0 || opportunity.sell_price <= 0.0 {
        return Err(ValidationFailure::NonPositive);
    }
    if opportunity.amount < min_trade_amount {
        return Err(ValidationFailure::BelowMinAmount { amount: opportunity.amount, minimum: min_trade_amount });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceLevel;

    fn book(venue: &str, instrument: &str, asks: Vec<PriceLevel>, bids: Vec<PriceLevel>, ts: DateTime<Utc>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            venue: VenueId::new(venue),
            instrument: Instrument::new(instrument),
            asks,
            bids,
            venue_timestamp: ts,
            local_receive_timestamp: ts,
        }
    }

    fn fees(rate: f64) -> TradingFees {
        TradingFees { maker_rate: rate, taker_rate: rate, percentage_flag: true, last_refreshed: Utc::now() }
    }

    #[test]
    fn profit_percent_zero_for_non_positive_buy_price() {
        assert_eq!(profit_percent(0.0, 10.0, 0.001, 0.001), 0.0);
        assert_eq!(profit_percent(-5.0, 10.0, 0.001, 0.001), 0.0);
    }

    #[test]
    fn s1_happy_path_matches_spec_numbers() {
        // spec.md S1: ask 100, bid 101, fees 0.1%/0.1%, amount 10, maxAmount 50.
        let now = Utc::now();
        let buy_book = book("A", "X/Y", vec![PriceLevel { price: 100.0, amount: 10.0 }], vec![], now);
        let sell_book = book("B", "X/Y", vec![], vec![PriceLevel { price: 101.0, amount: 10.0 }], now);
        let opp = candidate_opportunity(
            &Instrument::new("X/Y"),
            &VenueId::new("A"),
            &VenueId::new("B"),
            &buy_book,
            &sell_book,
            50.0,
            fees(0.001),
            fees(0.001),
        )
        .unwrap();
        assert_eq!(opp.amount, 10.0);
        assert!((opp.profit_percent - 0.799).abs() < 0.01);
        // buy_fee = 100*10*0.001 = 1.0, sell_fee = 101*10*0.001 = 1.01
        // profit_amount = (101-100)*10 - 1.0 - 1.01 = 7.99
        assert!((opp.profit_amount - 7.99).abs() < 0.01);
    }

    #[test]
    fn candidate_none_when_either_side_empty() {
        let now = Utc::now();
        let buy_book = book("A", "X/Y", vec![], vec![], now);
        let sell_book = book("B", "X/Y", vec![], vec![PriceLevel { price: 101.0, amount: 10.0 }], now);
        assert!(candidate_opportunity(&Instrument::new("X/Y"), &VenueId::new("A"), &VenueId::new("B"), &buy_book, &sell_book, 50.0, fees(0.001), fees(0.001)).is_none());
    }

    #[test]
    fn validate_rejects_future_timestamp() {
        let opp = sample_opportunity_with_timestamp(Utc::now() + chrono::Duration::seconds(10));
        let err = validate_opportunity(&opp, Utc::now(), chrono::Duration::seconds(5), 0.0).unwrap_err();
        assert!(matches!(err, ValidationFailure::FutureTimestamp { .. }));
    }

    #[test]
    fn validate_rejects_stale_opportunity() {
        let opp = sample_opportunity_with_timestamp(Utc::now() - chrono::Duration::seconds(10));
        let err = validate_opportunity(&opp, Utc::now(), chrono::Duration::seconds(5), 0.0).unwrap_err();
        assert!(matches!(err, ValidationFailure::TooOld { .. }));
    }

    #[test]
    fn validate_accepts_fresh_opportunity() {
        let opp = sample_opportunity_with_timestamp(Utc::now());
        assert!(validate_opportunity(&opp, Utc::now(), chrono::Duration::seconds(5), 0.0).is_ok());
    }

    fn sample_opportunity_with_timestamp(ts: DateTime<Utc>) -> Opportunity {
        Opportunity {
            instrument: Instrument::new("X/Y"),
            buy_venue: VenueId::new("A"),
            sell_venue: VenueId::new("B"),
            buy_price: 100.0,
            sell_price: 101.0,
            amount: 10.0,
            profit_percent: 0.8,
            profit_amount: 8.0,
            timestamp: ts,
            fees: FeeBreakdown { buy_fee: 0.1, sell_fee: 0.1, total: 0.2 },
        }
    }
}
