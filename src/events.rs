//! Typed fanout events, see spec.md §9 "Event emitter + listener callbacks".
//!
//! Replaces the teacher's callback-registration style (e.g.
//! `route_quality::prober`'s polling-and-log pattern) with a
//! `tokio::sync::broadcast` channel: any number of observers can subscribe
//! without the gateway or strategy engine holding a registry of callbacks.

use crate::types::{OrderBookSnapshot, VenueId};

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    OrderBookUpdate { snapshot: OrderBookSnapshot },
    VenueError { venue: VenueId, message: String },
    VenueConnected { venue: VenueId },
    VenueDisconnected { venue: VenueId },
}

#[derive(Debug, Clone)]
pub enum StrategyEvent {
    OpportunityFound { trade_key: String, profit_percent: f64 },
    ExecutionCompleted { trade_key: String, success: bool, actual_profit: Option<f64> },
    StatusUpdate { message: String },
}
