//! Arbitrage Strategy Engine (C4), see spec.md §4.4.

pub mod engine;
pub mod opportunity;
pub mod variance;

pub use engine::ArbitrageStrategyEngine;
pub use variance::VarianceTelemetry;
