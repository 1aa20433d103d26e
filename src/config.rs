//! Environment configuration, see spec.md §6 and SPEC_FULL.md §2 [CONFIG].
//!
//! Config loads before the tracing subscriber is installed, so parse
//! failures can't simply be logged -- they're buffered here (the cyclic
//! config/logger import pattern noted in spec.md §9) and drained by
//! `main.rs` as soon as the subscriber exists.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::errors::EngineError;
use crate::types::{Instrument, VenueId};

const WARNING_QUEUE_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownBehavior {
    Cancel,
    Wait,
    Force,
}

#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_password: Option<String>,
    pub rate_limit: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub min_profit_percent: f64,
    pub max_trade_amount: f64,
    pub check_interval: Duration,
    pub max_slippage: f64,
    pub partial_fill_threshold: f64,
    pub price_tolerance_percent: f64,
    pub max_profit_erosion_percent: f64,
    pub dynamic_tolerance_enabled: bool,
    /// Not named by an env var in the source; kept as a literal default
    /// per spec.md §9's open question on `minTradeAmount(instrument)`.
    pub min_trade_amount: f64,
    /// Buffer required on top of the computed notional before a buy leg is
    /// allowed, absorbing quote-price drift between balance check and
    /// submission. Unnamed in the source; literal default.
    pub reserve_percent: f64,
    pub order_timeout: Duration,
    pub trade_settle_drain: Duration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.5,
            max_trade_amount: 100.0,
            check_interval: Duration::from_secs(5),
            max_slippage: 0.01,
            partial_fill_threshold: 95.0,
            min_trade_amount: 0.0001,
            reserve_percent: 0.01,
            order_timeout: Duration::from_secs(30),
            trade_settle_drain: Duration::from_secs(60),
            price_tolerance_percent: 0.1,
            max_profit_erosion_percent: 20.0,
            dynamic_tolerance_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub test_mode: bool,
    pub enabled_exchanges: Vec<VenueId>,
    pub credentials: HashMap<VenueId, VenueCredentials>,
    pub trading_symbols: Vec<Instrument>,
    pub max_concurrent_trades: usize,
    pub order_book_depth: usize,
    pub order_book_staleness_threshold: Duration,
    pub shutdown_behavior: ShutdownBehavior,
    pub strategy: StrategyConfig,
    /// Warnings raised while parsing, flushed once logging is ready.
    warnings: VecDeque<String>,
}

impl Config {
    /// Load from the process environment, following the teacher's
    /// `Config::from_env` convention: `.ok()`/`unwrap_or_else` with literal
    /// defaults rather than panicking on a missing var.
    pub fn from_env() -> Result<Self, EngineError> {
        dotenv::dotenv().ok();
        let mut warnings = VecDeque::new();

        let test_mode = env_bool("TEST_MODE", true, &mut warnings);

        let enabled_exchanges: Vec<VenueId> = env_csv("ENABLED_EXCHANGES")
            .into_iter()
            .map(|s| VenueId::new(s))
            .collect();

        let mut credentials = HashMap::new();
        for venue in &enabled_exchanges {
            let prefix = venue.0.to_uppercase();
            let rate_limit = std::env::var(format!("{prefix}_RATE_LIMIT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            let timeout_secs: u64 = std::env::var(format!("{prefix}_TIMEOUT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            credentials.insert(
                venue.clone(),
                VenueCredentials {
                    api_key: std::env::var(format!("{prefix}_API_KEY")).ok(),
                    api_secret: std::env::var(format!("{prefix}_API_SECRET")).ok(),
                    api_password: std::env::var(format!("{prefix}_API_PASSWORD")).ok(),
                    rate_limit,
                    timeout: Duration::from_secs(timeout_secs),
                },
            );

            if !test_mode && credentials[venue].api_key.is_none() {
                return Err(EngineError::Config(format!(
                    "venue {venue} is enabled outside TEST_MODE but has no {prefix}_API_KEY"
                )));
            }
        }

        let trading_symbols: Vec<Instrument> = env_csv("TRADING_SYMBOLS")
            .into_iter()
            .map(|s| parse_instrument(&s))
            .collect::<Result<Vec<_>, _>>()?;

        let max_concurrent_trades = env_parse("MAX_CONCURRENT_TRADES", 3usize, &mut warnings);
        let order_book_depth = env_parse("ORDER_BOOK_DEPTH", 10usize, &mut warnings);
        let staleness_ms = env_parse("ORDER_BOOK_STALENESS_THRESHOLD_MS", 500u64, &mut warnings);

        let shutdown_behavior = match std::env::var("SHUTDOWN_BEHAVIOR")
            .unwrap_or_else(|_| "wait".to_string())
            .to_lowercase()
            .as_str()
        {
            "cancel" => ShutdownBehavior::Cancel,
            "force" => ShutdownBehavior::Force,
            "wait" => ShutdownBehavior::Wait,
            other => {
                warnings.push_back(format!(
                    "unrecognized SHUTDOWN_BEHAVIOR={other:?}, defaulting to wait"
                ));
                ShutdownBehavior::Wait
            }
        };

        let mut strategy = StrategyConfig::default();
        strategy.min_profit_percent = env_parse(
            "SIMPLE_ARBITRAGE_MIN_PROFIT",
            strategy.min_profit_percent,
            &mut warnings,
        );
        strategy.max_trade_amount = env_parse(
            "SIMPLE_ARBITRAGE_MAX_TRADE_AMOUNT",
            strategy.max_trade_amount,
            &mut warnings,
        );
        let check_interval_secs = env_parse(
            "SIMPLE_ARBITRAGE_CHECK_INTERVAL",
            strategy.check_interval.as_secs(),
            &mut warnings,
        );
        strategy.check_interval = Duration::from_secs(check_interval_secs);
        strategy.max_slippage = env_parse(
            "SIMPLE_ARBITRAGE_MAX_SLIPPAGE",
            strategy.max_slippage,
            &mut warnings,
        );
        strategy.partial_fill_threshold = env_parse(
            "SIMPLE_ARBITRAGE_PARTIAL_FILL_THRESHOLD",
            strategy.partial_fill_threshold,
            &mut warnings,
        );
        strategy.price_tolerance_percent = env_parse(
            "SIMPLE_ARBITRAGE_PRICE_TOLERANCE",
            strategy.price_tolerance_percent,
            &mut warnings,
        );
        strategy.max_profit_erosion_percent = env_parse(
            "SIMPLE_ARBITRAGE_MAX_PROFIT_EROSION",
            strategy.max_profit_erosion_percent,
            &mut warnings,
        );
        strategy.dynamic_tolerance_enabled = env_bool(
            "SIMPLE_ARBITRAGE_DYNAMIC_TOLERANCE",
            strategy.dynamic_tolerance_enabled,
            &mut warnings,
        );

        Ok(Self {
            test_mode,
            enabled_exchanges,
            credentials,
            trading_symbols,
            max_concurrent_trades,
            order_book_depth,
            order_book_staleness_threshold: Duration::from_millis(staleness_ms),
            shutdown_behavior,
            strategy,
            warnings,
        })
    }

    /// Drain buffered warnings once a logger is installed. No-op if empty or
    /// logging never initializes.
    pub fn drain_warnings(&mut self) -> Vec<String> {
        self.warnings.drain(..).collect()
    }
}

/// `TRADING_SYMBOLS` entries must be `BASE/QUOTE` with non-empty sides --
/// this is the one place that guarantees `Instrument::base_quote` never
/// panics on a value that reached it through config.
fn parse_instrument(raw: &str) -> Result<Instrument, EngineError> {
    match raw.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(Instrument::new(raw)),
        _ => Err(EngineError::Config(format!(
            "invalid TRADING_SYMBOLS entry {raw:?}: expected BASE/QUOTE"
        ))),
    }
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_bool(key: &str, default: bool, warnings: &mut VecDeque<String>) -> bool {
    match std::env::var(key) {
        Err(_) => default,
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                push_warning(warnings, format!("invalid bool for {key}={v:?}, using default"));
                default
            }
        },
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T, warnings: &mut VecDeque<String>) -> T {
    match std::env::var(key) {
        Err(_) => default,
        Ok(v) => v.parse().unwrap_or_else(|_| {
            push_warning(warnings, format!("invalid value for {key}={v:?}, using default"));
            default
        }),
    }
}

fn push_warning(warnings: &mut VecDeque<String>, message: String) {
    if warnings.len() >= WARNING_QUEUE_CAP {
        warnings.pop_front();
    }
    warnings.push_back(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "TEST_MODE",
            "ENABLED_EXCHANGES",
            "MAX_CONCURRENT_TRADES",
            "SHUTDOWN_BEHAVIOR",
        ] {
            std::env::remove_var(key);
        }
        let cfg = Config::from_env().unwrap();
        assert!(cfg.test_mode);
        assert_eq!(cfg.max_concurrent_trades, 3);
        assert_eq!(cfg.shutdown_behavior, ShutdownBehavior::Wait);
    }

    #[test]
    fn rejects_live_venue_without_credentials() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TEST_MODE", "false");
        std::env::set_var("ENABLED_EXCHANGES", "alpha");
        std::env::remove_var("ALPHA_API_KEY");
        let result = Config::from_env();
        std::env::remove_var("TEST_MODE");
        std::env::remove_var("ENABLED_EXCHANGES");
        assert!(result.is_err());
    }

    #[test]
    fn malformed_trading_symbol_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TRADING_SYMBOLS", "BTCUSD");
        let result = Config::from_env();
        std::env::remove_var("TRADING_SYMBOLS");
        assert!(result.is_err());
    }

    #[test]
    fn bad_numeric_value_falls_back_and_warns() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MAX_CONCURRENT_TRADES", "not-a-number");
        let mut cfg = Config::from_env().unwrap();
        std::env::remove_var("MAX_CONCURRENT_TRADES");
        assert_eq!(cfg.max_concurrent_trades, 3);
        assert!(cfg.drain_warnings().iter().any(|w| w.contains("MAX_CONCURRENT_TRADES")));
    }
}
