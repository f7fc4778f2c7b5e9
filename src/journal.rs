// =============================================================================
// Trade Journal — append-only trade log, store snapshots, session results
// =============================================================================
//
// Three artifacts:
//   1. Trade log  — JSON lines, one record per open and per close. Appended
//      with a single write per record so a torn write loses at most the last
//      line.
//   2. Store snapshot — full open-position set, written atomically
//      (tmp + rename) for crash recovery.
//   3. Session result — aggregate metrics written once at shutdown.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::Position;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One line of the trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// "open" or "close".
    pub event: String,
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub quantity: f64,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    pub confidence_at_entry: f64,
}

/// Aggregate session metrics written at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}

impl SessionResult {
    /// Compute session metrics from the closed-position set.
    pub fn from_closed(closed: &[Position], started_at: DateTime<Utc>) -> Self {
        let total_trades = closed.len();
        let wins = closed.iter().filter(|p| p.realized_pnl > 0.0).count();
        let losses = total_trades - wins;
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        };
        let total_net_pnl: f64 = closed.iter().map(|p| p.realized_pnl).sum();
        let gross_profit: f64 = closed
            .iter()
            .map(|p| p.realized_pnl)
            .filter(|&pnl| pnl > 0.0)
            .sum();
        let gross_loss: f64 = closed
            .iter()
            .map(|p| p.realized_pnl)
            .filter(|&pnl| pnl < 0.0)
            .map(f64::abs)
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            started_at,
            ended_at: Utc::now(),
            total_trades,
            wins,
            losses,
            win_rate,
            total_net_pnl,
            profit_factor,
        }
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

pub struct TradeJournal {
    trade_log_path: PathBuf,
    snapshot_path: PathBuf,
    session_result_path: PathBuf,
}

impl TradeJournal {
    pub fn new(
        trade_log_path: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
        session_result_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            trade_log_path: trade_log_path.into(),
            snapshot_path: snapshot_path.into(),
            session_result_path: session_result_path.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Trade log
    // -------------------------------------------------------------------------

    /// Append an open record for `position`.
    pub fn record_open(&self, position: &Position) -> Result<()> {
        let record = TradeRecord {
            event: "open".to_string(),
            id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side.to_string(),
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: None,
            exit_price: None,
            quantity: position.quantity,
            realized_pnl: None,
            exit_reason: None,
            strategy_tag: position.strategy_tag.clone(),
            confidence_at_entry: position.confidence_at_entry,
        };
        self.append(&record)
    }

    /// Append a close record for `position` (which must carry its exit
    /// fields already).
    pub fn record_close(&self, position: &Position) -> Result<()> {
        let record = TradeRecord {
            event: "close".to_string(),
            id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side.to_string(),
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: position.closed_at,
            exit_price: Some(position.current_price),
            quantity: position.quantity,
            realized_pnl: Some(position.realized_pnl),
            exit_reason: position.exit_reason,
            strategy_tag: position.strategy_tag.clone(),
            confidence_at_entry: position.confidence_at_entry,
        };
        self.append(&record)
    }

    fn append(&self, record: &TradeRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize trade record")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trade_log_path)
            .with_context(|| {
                format!("failed to open trade log {}", self.trade_log_path.display())
            })?;

        writeln!(file, "{line}").context("failed to append trade record")?;
        Ok(())
    }

    /// Read back every parseable record. Torn trailing lines are skipped
    /// with a warning rather than failing the whole read.
    pub fn read_records(&self) -> Result<Vec<TradeRecord>> {
        let content = match std::fs::read_to_string(&self.trade_log_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read trade log {}", self.trade_log_path.display())
                })
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(lineno, error = %e, "skipping unparseable trade log line"),
            }
        }
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Store snapshot
    // -------------------------------------------------------------------------

    /// Atomically persist the open-position snapshot.
    pub fn write_snapshot(&self, positions: &[Position]) -> Result<()> {
        write_atomic(&self.snapshot_path, positions)
    }

    /// Load the last persisted snapshot, or an empty set when none exists.
    pub fn load_snapshot(&self) -> Result<Vec<Position>> {
        match std::fs::read_to_string(&self.snapshot_path) {
            Ok(content) => serde_json::from_str(&content).with_context(|| {
                format!(
                    "failed to parse position snapshot {}",
                    self.snapshot_path.display()
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "failed to read position snapshot {}",
                    self.snapshot_path.display()
                )
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Session result
    // -------------------------------------------------------------------------

    pub fn write_session_result(&self, result: &SessionResult) -> Result<()> {
        write_atomic(&self.session_result_path, result)?;
        info!(
            path = %self.session_result_path.display(),
            total_trades = result.total_trades,
            net_pnl = result.total_net_pnl,
            "session result written"
        );
        Ok(())
    }
}

/// Serialize `value` to `path` via tmp + rename.
fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("serialization failed")?;
    let tmp = path.with_extension("tmp");

    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("trade_log", &self.trade_log_path)
            .field("snapshot", &self.snapshot_path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PositionStore;
    use crate::types::Side;

    fn journal(dir: &tempfile::TempDir) -> TradeJournal {
        TradeJournal::new(
            dir.path().join("trades.jsonl"),
            dir.path().join("positions.json"),
            dir.path().join("session.json"),
        )
    }

    fn position() -> Position {
        PositionStore::build_position(
            "BTCUSDT",
            Side::Long,
            30_000.0,
            0.44,
            29_550.0,
            31_125.0,
            0.65,
            300.0,
            0.6,
            Some("heikin-ashi".to_string()),
            None,
        )
    }

    #[test]
    fn open_then_close_appends_two_lines() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);

        let mut p = position();
        j.record_open(&p).unwrap();

        p.current_price = 31_125.0;
        p.realized_pnl = (31_125.0 - 30_000.0) * 0.44;
        p.closed_at = Some(Utc::now());
        p.exit_reason = Some(ExitReason::TakeProfit);
        j.record_close(&p).unwrap();

        let records = j.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "open");
        assert_eq!(records[1].event, "close");
        assert_eq!(records[1].exit_reason, Some(ExitReason::TakeProfit));
        assert!((records[1].realized_pnl.unwrap() - 495.0).abs() < 1e-9);
        assert_eq!(records[0].id, records[1].id);
    }

    #[test]
    fn close_record_pnl_matches_price_identity() {
        // Invariant: realized_pnl == (exit - entry) * qty * side_sign.
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);

        let mut p = position();
        p.side = Side::Short;
        p.current_price = 29_000.0;
        p.realized_pnl = (29_000.0 - 30_000.0) * 0.44 * -1.0;
        p.closed_at = Some(Utc::now());
        p.exit_reason = Some(ExitReason::StopLoss);
        j.record_close(&p).unwrap();

        let r = &j.read_records().unwrap()[0];
        let expected = (r.exit_price.unwrap() - r.entry_price) * r.quantity * -1.0;
        assert!((r.realized_pnl.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);
        j.record_open(&position()).unwrap();

        // Simulate a crash mid-append.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("trades.jsonl"))
            .unwrap();
        write!(file, "{{\"event\":\"close\",\"id\":\"trunc").unwrap();

        let records = j.read_records().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(journal(&dir).read_records().unwrap().is_empty());
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);

        let p = position();
        j.write_snapshot(&[p.clone()]).unwrap();

        let loaded = j.load_snapshot().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, p.id);
        assert_eq!(loaded[0].entry_price, p.entry_price);
        // no tmp file left behind
        assert!(!dir.path().join("positions.tmp").exists());
    }

    #[test]
    fn missing_snapshot_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(journal(&dir).load_snapshot().unwrap().is_empty());
    }

    #[test]
    fn session_metrics() {
        let started = Utc::now();
        let mut wins = position();
        wins.realized_pnl = 300.0;
        let mut loss1 = position();
        loss1.realized_pnl = -100.0;
        let mut loss2 = position();
        loss2.realized_pnl = -50.0;

        let result = SessionResult::from_closed(&[wins, loss1, loss2], started);
        assert_eq!(result.total_trades, 3);
        assert_eq!(result.wins, 1);
        assert_eq!(result.losses, 2);
        assert!((result.win_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((result.total_net_pnl - 150.0).abs() < 1e-9);
        assert!((result.profit_factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn session_metrics_empty() {
        let result = SessionResult::from_closed(&[], Utc::now());
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.profit_factor, 0.0);
    }

    #[test]
    fn session_result_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);
        let result = SessionResult::from_closed(&[], Utc::now());
        j.write_session_result(&result).unwrap();

        let content = std::fs::read_to_string(dir.path().join("session.json")).unwrap();
        let back: SessionResult = serde_json::from_str(&content).unwrap();
        assert_eq!(back.total_trades, 0);
    }
}
