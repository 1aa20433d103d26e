//! Supervisor (C5): initialize -> run -> graceful shutdown with a
//! configurable drain policy. See spec.md §4.5.
//!
//! Grounded in the teacher's top-level `main.rs` wiring order (load env,
//! init logging, construct long-lived components, start background loops),
//! adapted into an explicit struct rather than a bag of locals so the
//! supervisor can be constructed and shut down from a test.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{Config, ShutdownBehavior};
use crate::errors::EngineError;
use crate::gateway::paper_driver::PaperVenueDriver;
use crate::gateway::{HandleConfig, VenueDriver, VenueDriverRegistry};
use crate::ledger::TradeStateLedger;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::strategy::ArbitrageStrategyEngine;
use crate::types::VenueId;

pub struct Supervisor {
    registry: Arc<VenueDriverRegistry>,
    ledger: Arc<TradeStateLedger>,
    strategy: Arc<ArbitrageStrategyEngine>,
    shutdown_behavior: ShutdownBehavior,
}

impl Supervisor {
    /// Builds every long-lived component. Per-venue driver initialization
    /// may partially fail: the failure is logged and that venue is excluded
    /// rather than aborting startup entirely.
    pub async fn initialize(config: &Config, ledger_path: impl Into<std::path::PathBuf>) -> Result<Self, EngineError> {
        let mut registry = VenueDriverRegistry::new();
        let handle_config = HandleConfig {
            staleness_threshold: config.order_book_staleness_threshold,
            ..HandleConfig::default()
        };

        for venue in &config.enabled_exchanges {
            match build_driver(venue, config) {
                Ok(driver) => registry.register(venue.clone(), driver, handle_config.clone()),
                Err(e) => error!(venue = %venue, error = %e, "failed to initialize venue driver, excluding from this run"),
            }
        }

        let ledger = Arc::new(TradeStateLedger::open(ledger_path)?);
        let recovery = ledger.recover();
        info!(
            resumable = recovery.resumable.len(),
            orphaned = recovery.orphaned.len(),
            "ledger recovery complete"
        );
        for orphan in &recovery.orphaned {
            warn!(trade_key = %orphan.trade_key, started_at = %orphan.started_at, "orphaned trade requires operator acknowledgement");
        }

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let registry = Arc::new(registry);

        let strategy = Arc::new(ArbitrageStrategyEngine::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            limiter,
            config.strategy.clone(),
            config.max_concurrent_trades,
            config.trading_symbols.clone(),
            config.order_book_depth,
        ));

        Ok(Self {
            registry,
            ledger,
            strategy,
            shutdown_behavior: config.shutdown_behavior,
        })
    }

    pub fn ledger(&self) -> &Arc<TradeStateLedger> {
        &self.ledger
    }

    pub fn strategy(&self) -> &Arc<ArbitrageStrategyEngine> {
        &self.strategy
    }

    pub fn run(&self) {
        self.strategy.start();
    }

    /// Runs the drain policy named by `shutdownBehavior` then closes every
    /// venue handle.
    pub async fn shutdown(&self) {
        match self.shutdown_behavior {
            ShutdownBehavior::Cancel => {
                info!("shutdown behavior = cancel: cancelling all open orders");
                self.registry.cancel_all_open_orders().await;
                self.strategy.stop().await;
            }
            ShutdownBehavior::Wait => {
                info!("shutdown behavior = wait: draining in-flight trades");
                self.strategy.stop().await;
            }
            ShutdownBehavior::Force => {
                info!("shutdown behavior = force: exiting without draining");
            }
        }
        self.registry.close_all().await;
    }
}

/// Registry keyed by `VenueId` producing a `VenueDriver`, see spec.md §9
/// "Dynamic access to venue drivers". Under `TEST_MODE` every venue gets an
/// in-memory `PaperVenueDriver`; outside it, this is the seam a real
/// HTTP/WebSocket adapter registry would plug into (out of scope here, see
/// spec.md §1 -- `VenueDriver` is treated as an opaque external capability).
fn build_driver(venue: &VenueId, config: &Config) -> Result<Arc<dyn VenueDriver>, EngineError> {
    if config.test_mode {
        let driver = PaperVenueDriver::new(venue.clone());
        for instrument in &config.trading_symbols {
            driver.seed_book(crate::types::OrderBookSnapshot {
                venue: venue.clone(),
                instrument: instrument.clone(),
                asks: vec![],
                bids: vec![],
                venue_timestamp: chrono::Utc::now(),
                local_receive_timestamp: chrono::Utc::now(),
            });
        }
        let (base_seed, quote_seed) = (1_000.0, 1_000_000.0);
        for instrument in &config.trading_symbols {
            let (base, quote) = instrument.base_quote();
            driver.seed_balance(base, base_seed);
            driver.seed_balance(quote, quote_seed);
        }
        Ok(Arc::new(driver))
    } else {
        Err(EngineError::Config(format!(
            "venue {venue}: no live VenueDriver implementation registered (VenueDriver is an opaque external capability, see spec.md §1)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[tokio::test]
    async fn initialize_registers_a_paper_driver_per_venue_in_test_mode() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("TEST_MODE", "true");
        std::env::set_var("ENABLED_EXCHANGES", "alpha,beta");
        std::env::set_var("TRADING_SYMBOLS", "BTC/USD");
        let config = Config::from_env().unwrap();
        std::env::remove_var("TEST_MODE");
        std::env::remove_var("ENABLED_EXCHANGES");
        std::env::remove_var("TRADING_SYMBOLS");

        let supervisor = Supervisor::initialize(&config, dir.path().join("trade-state.json")).await.unwrap();
        assert_eq!(supervisor.ledger().active_len(), 0);
        assert_eq!(supervisor.registry.venues().count(), 2);
    }
}
