//! Trade State Ledger (C2): crash-consistent persistence of in-flight trades,
//! recovery + orphan detection. See spec.md §4.2 and §6 (persistent state
//! layout).
//!
//! Storage format is a single JSON document, written atomically
//! (write-temp-then-rename) on every mutation, grounded in the teacher's
//! `write_output_atomic` helper in `src/bin/backtest_run.rs` (write to a
//! `.tmp` sibling, flush, `fs::rename` over the target -- atomic on POSIX),
//! generalized here to fsync the temp file before the rename so the durable
//! write survives a crash between rename and the next read.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineError;
use crate::types::{OrderResult, TradeLedgerEntry, TradeStatus};

const LEDGER_VERSION: u32 = 1;
const DEFAULT_ORPHAN_THRESHOLD: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerDocument {
    version: u32,
    last_updated: i64,
    active_trades: HashMap<String, TradeLedgerEntry>,
}

impl LedgerDocument {
    fn empty() -> Self {
        Self {
            version: LEDGER_VERSION,
            last_updated: Utc::now().timestamp_millis(),
            active_trades: HashMap::new(),
        }
    }
}

pub struct RecoveryReport {
    pub resumable: Vec<TradeLedgerEntry>,
    pub orphaned: Vec<TradeLedgerEntry>,
}

pub struct TradeStateLedger {
    path: PathBuf,
    orphan_threshold: chrono::Duration,
    doc: Mutex<LedgerDocument>,
}

impl TradeStateLedger {
    /// Loads `path` if it exists. Missing file -> start empty. Version
    /// mismatch -> start empty and log a warning; the file itself is left
    /// alone so an operator can inspect it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        Self::open_with_orphan_threshold(path, DEFAULT_ORPHAN_THRESHOLD)
    }

    pub fn open_with_orphan_threshold(
        path: impl Into<PathBuf>,
        orphan_threshold: chrono::Duration,
    ) -> Result<Self, EngineError> {
        let path = path.into();
        let doc = match fs::read_to_string(&path) {
            Err(_) => LedgerDocument::empty(),
            Ok(raw) => match serde_json::from_str::<LedgerDocument>(&raw) {
                Ok(doc) if doc.version == LEDGER_VERSION => doc,
                Ok(doc) => {
                    warn!(
                        found = doc.version,
                        expected = LEDGER_VERSION,
                        path = %path.display(),
                        "ledger version mismatch, starting with an empty active set"
                    );
                    LedgerDocument::empty()
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "ledger file is unreadable, starting with an empty active set");
                    LedgerDocument::empty()
                }
            },
        };

        Ok(Self {
            path,
            orphan_threshold,
            doc: Mutex::new(doc),
        })
    }

    /// Creates an entry in state `pending`. fsyncs before returning.
    pub fn record_start(&self, opportunity: crate::types::Opportunity) -> Result<String, EngineError> {
        let trade_key = opportunity.trade_key();
        let now = Utc::now();
        let entry = TradeLedgerEntry::new(opportunity, now);

        let mut doc = self.doc.lock();
        doc.active_trades.insert(trade_key.clone(), entry);
        self.persist_locked(&mut doc)?;
        Ok(trade_key)
    }

    /// Transitions to `buyExecuted`. fsyncs before returning.
    pub fn record_buy_executed(&self, trade_key: &str, buy_result: OrderResult) -> Result<(), EngineError> {
        let mut doc = self.doc.lock();
        let entry = doc.active_trades.get_mut(trade_key).ok_or_else(|| {
            EngineError::Invariant(format!("record_buy_executed: unknown trade_key {trade_key}"))
        })?;
        entry.status = TradeStatus::BuyExecuted;
        entry.buy_result = Some(buy_result);
        entry.updated_at = Utc::now();
        self.persist_locked(&mut doc)
    }

    /// Transitions to `completed`|`failed`, removes from the active set,
    /// fsyncs. The removed entry is returned so the caller can log it.
    pub fn record_complete(
        &self,
        trade_key: &str,
        success: bool,
        sell_result: Option<OrderResult>,
        failure_reason: Option<String>,
    ) -> Result<TradeLedgerEntry, EngineError> {
        let mut doc = self.doc.lock();
        let mut entry = doc.active_trades.remove(trade_key).ok_or_else(|| {
            EngineError::Invariant(format!("record_complete: unknown trade_key {trade_key}"))
        })?;
        entry.status = if success { TradeStatus::Completed } else { TradeStatus::Failed };
        entry.sell_result = sell_result;
        entry.failure_reason = failure_reason;
        entry.updated_at = Utc::now();
        self.persist_locked(&mut doc)?;
        Ok(entry)
    }

    /// Called once at startup. Entries with `startedAt` older than the
    /// orphan threshold are `orphaned`; the rest are `resumable`. Orphans are
    /// reported but NOT removed -- an operator must acknowledge them.
    pub fn recover(&self) -> RecoveryReport {
        let doc = self.doc.lock();
        let now = Utc::now();
        let mut resumable = Vec::new();
        let mut orphaned = Vec::new();
        for entry in doc.active_trades.values() {
            if now.signed_duration_since(entry.started_at) > self.orphan_threshold {
                orphaned.push(entry.clone());
            } else {
                resumable.push(entry.clone());
            }
        }
        RecoveryReport { resumable, orphaned }
    }

    /// Removes an orphan after human inspection.
    pub fn acknowledge_orphan(&self, trade_key: &str) -> Result<(), EngineError> {
        let mut doc = self.doc.lock();
        if doc.active_trades.remove(trade_key).is_none() {
            return Err(EngineError::Invariant(format!(
                "acknowledge_orphan: unknown trade_key {trade_key}"
            )));
        }
        self.persist_locked(&mut doc)
    }

    pub fn active_len(&self) -> usize {
        self.doc.lock().active_trades.len()
    }

    pub fn get(&self, trade_key: &str) -> Option<TradeLedgerEntry> {
        self.doc.lock().active_trades.get(trade_key).cloned()
    }

    fn persist_locked(&self, doc: &mut LedgerDocument) -> Result<(), EngineError> {
        doc.last_updated = Utc::now().timestamp_millis();
        let serialized = serde_json::to_string_pretty(doc)
            .map_err(|e| EngineError::LedgerIo(format!("serialize: {e}")))?;
        atomic_write(&self.path, &serialized)
            .map_err(|e| EngineError::LedgerIo(format!("write {}: {e}", self.path.display())))
    }
}

fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    // Best-effort directory fsync so the rename itself survives a crash.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeeBreakdown, Instrument, Opportunity, VenueId};

    fn sample_opportunity() -> Opportunity {
        Opportunity {
            instrument: Instrument::new("BTC/USD"),
            buy_venue: VenueId::new("alpha"),
            sell_venue: VenueId::new("beta"),
            buy_price: 100.0,
            sell_price: 101.0,
            amount: 1.0,
            profit_percent: 0.5,
            profit_amount: 0.5,
            timestamp: Utc::now(),
            fees: FeeBreakdown { buy_fee: 0.1, sell_fee: 0.1, total: 0.2 },
        }
    }

    #[test]
    fn record_start_then_buy_executed_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade-state.json");
        let ledger = TradeStateLedger::open(&path).unwrap();

        let key = ledger.record_start(sample_opportunity()).unwrap();
        assert_eq!(ledger.active_len(), 1);

        let reloaded = TradeStateLedger::open(&path).unwrap();
        let entry = reloaded.get(&key).unwrap();
        assert_eq!(entry.status, TradeStatus::Pending);
    }

    #[test]
    fn completed_trades_are_removed_from_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade-state.json");
        let ledger = TradeStateLedger::open(&path).unwrap();

        let key = ledger.record_start(sample_opportunity()).unwrap();
        ledger.record_complete(&key, false, None, Some("buy failed".into())).unwrap();
        assert_eq!(ledger.active_len(), 0);

        let reloaded = TradeStateLedger::open(&path).unwrap();
        assert_eq!(reloaded.active_len(), 0);
    }

    #[test]
    fn recover_splits_resumable_and_orphaned_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade-state.json");
        let ledger = TradeStateLedger::open_with_orphan_threshold(&path, chrono::Duration::hours(24)).unwrap();

        let fresh_key = ledger.record_start(sample_opportunity()).unwrap();

        // Simulate an old entry by writing one directly with an aged startedAt.
        {
            let mut doc = ledger.doc.lock();
            let mut old = doc.active_trades.get(&fresh_key).unwrap().clone();
            old.trade_key = "BTC/USD-gamma-delta".to_string();
            old.started_at = Utc::now() - chrono::Duration::hours(25);
            doc.active_trades.insert(old.trade_key.clone(), old);
            ledger.persist_locked(&mut doc).unwrap();
        }

        let report = ledger.recover();
        assert_eq!(report.resumable.len(), 1);
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].trade_key, "BTC/USD-gamma-delta");
    }

    #[test]
    fn acknowledge_orphan_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade-state.json");
        let ledger = TradeStateLedger::open_with_orphan_threshold(&path, chrono::Duration::hours(24)).unwrap();
        let key = ledger.record_start(sample_opportunity()).unwrap();
        {
            let mut doc = ledger.doc.lock();
            let entry = doc.active_trades.get_mut(&key).unwrap();
            entry.started_at = Utc::now() - chrono::Duration::hours(48);
        }
        assert_eq!(ledger.recover().orphaned.len(), 1);
        ledger.acknowledge_orphan(&key).unwrap();
        assert_eq!(ledger.active_len(), 0);
    }

    #[test]
    fn unknown_version_starts_empty_without_deleting_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade-state.json");
        fs::write(&path, r#"{"version": 99, "lastUpdated": 0, "activeTrades": {}}"#).unwrap();

        let ledger = TradeStateLedger::open(&path).unwrap();
        assert_eq!(ledger.active_len(), 0);
        assert!(path.exists());
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let ledger = TradeStateLedger::open(&path).unwrap();
        assert_eq!(ledger.active_len(), 0);
    }
}
