//! Cross-venue arbitrage execution engine. See spec.md §1-§9.

pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod rate_limiter;
pub mod strategy;
pub mod supervisor;
pub mod types;
