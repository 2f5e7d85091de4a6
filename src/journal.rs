// =============================================================================
// Journals — per-day CSV records of trades, signals, and orders
// =============================================================================
//
// Write-only from the core. One file per (kind, UTC day):
//
//   trades_YYYY-MM-DD.csv   one row per closing event
//   signals_YYYY-MM-DD.csv  one row per evaluated signal (executed or not)
//   orders_YYYY-MM-DD.csv   one row per order submission/fill
//
// Headers are written when a file is first created; rows append after that.
// Secrets never reach any journal.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::types::TradeResult;

/// A signal-journal row.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub strength: f64,
    pub regime: String,
    /// Filter names in application order, `;`-joined.
    pub filters_passed: String,
    pub executed: bool,
    /// Component that rejected the signal when `executed` is false.
    pub rejected_by: String,
    pub linked_order_id: String,
}

/// An order-journal row. Slippage carries explicit units.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub size: f64,
    pub price: Option<f64>,
    pub status: String,
    pub fill_price: f64,
    pub fill_size: f64,
    pub slippage: f64,
    /// "usd" or "percent".
    pub slippage_units: String,
    pub time_in_force: String,
    pub trigger_price: Option<f64>,
    pub fill_id: String,
}

/// A trade-journal row, flattened from [`TradeResult`].
#[derive(Debug, Clone, Serialize)]
struct TradeRow {
    timestamp: String,
    symbol: String,
    side: String,
    entry_price: f64,
    exit_price: f64,
    size: f64,
    gross_pnl: f64,
    commission: f64,
    funding_fee: f64,
    net_pnl: f64,
    duration_seconds: i64,
    exit_reason: String,
    regime_at_entry: String,
}

/// Append-only CSV journal set rooted at one directory.
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn append_trade(&self, result: &TradeResult) -> Result<()> {
        let row = TradeRow {
            timestamp: result.closed_at.clone(),
            symbol: result.symbol.clone(),
            side: result.side.to_string(),
            entry_price: result.entry_price,
            exit_price: result.exit_price,
            size: result.size_contracts,
            gross_pnl: result.gross_pnl,
            commission: result.commission,
            funding_fee: result.funding_fee,
            net_pnl: result.net_pnl,
            duration_seconds: result.duration_seconds,
            exit_reason: result.exit_reason.to_string(),
            regime_at_entry: result.regime_at_entry.clone(),
        };
        self.append("trades", &row)
    }

    pub fn append_signal(&self, record: &SignalRecord) -> Result<()> {
        self.append("signals", record)
    }

    pub fn append_order(&self, record: &OrderRecord) -> Result<()> {
        self.append("orders", record)
    }

    fn append<T: Serialize>(&self, kind: &str, row: &T) -> Result<()> {
        let date = Utc::now().format("%Y-%m-%d");
        let path = self.dir.join(format!("{kind}_{date}.csv"));
        let write_header = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer
            .serialize(row)
            .with_context(|| format!("failed to serialise {kind} journal row"))?;
        writer.flush().context("failed to flush journal")?;
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("dir", &self.dir).finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};

    fn sample_trade() -> TradeResult {
        TradeResult {
            position_id: "p1".into(),
            symbol: "BTC-USDT-SWAP".into(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 102.4,
            size_contracts: 3.0,
            gross_pnl: 7.2,
            commission: 0.05,
            funding_fee: 0.01,
            net_pnl: 7.14,
            duration_seconds: 180,
            exit_reason: ExitReason::Tp,
            regime_at_entry: "RANGING".into(),
            closed_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn trade_rows_append_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path()).unwrap();

        journal.append_trade(&sample_trade()).unwrap();
        journal.append_trade(&sample_trade()).unwrap();

        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 3, "header + two rows: {content}");
        assert!(lines[0].contains("exit_reason"));
        assert!(lines[0].contains("funding_fee"));
        assert!(lines[1].contains("tp"));
        assert!(lines[1].contains("RANGING"));
    }

    #[test]
    fn signal_row_records_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path()).unwrap();

        journal
            .append_signal(&SignalRecord {
                timestamp: "2026-01-01T00:00:00Z".into(),
                symbol: "BTC-USDT-SWAP".into(),
                side: "long".into(),
                price: 37_000.0,
                strength: 0.7,
                regime: "TRENDING".into(),
                filters_passed: "adx;mtf".into(),
                executed: false,
                rejected_by: "correlation".into(),
                linked_order_id: String::new(),
            })
            .unwrap();

        let path = dir.path().read_dir().unwrap().next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("false"));
        assert!(content.contains("correlation"));
        assert!(content.contains("adx;mtf"));
    }

    #[test]
    fn order_row_carries_mandated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path()).unwrap();

        journal
            .append_order(&OrderRecord {
                timestamp: "2026-01-01T00:00:00Z".into(),
                symbol: "ETH-USDT-SWAP".into(),
                side: "short".into(),
                order_type: "limit".into(),
                size: 2.0,
                price: Some(3_000.0),
                status: "filled".into(),
                fill_price: 2_999.5,
                fill_size: 2.0,
                slippage: -0.5,
                slippage_units: "usd".into(),
                time_in_force: "GTC".into(),
                trigger_price: None,
                fill_id: "f-123".into(),
            })
            .unwrap();

        let path = dir.path().read_dir().unwrap().next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let header = content.lines().next().unwrap();
        for field in [
            "slippage",
            "slippage_units",
            "time_in_force",
            "trigger_price",
            "fill_id",
            "fill_price",
        ] {
            assert!(header.contains(field), "missing {field} in {header}");
        }
        assert!(content.contains("f-123"));
    }

    #[test]
    fn files_are_per_day_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path()).unwrap();
        journal.append_trade(&sample_trade()).unwrap();

        let names: Vec<String> = dir
            .path()
            .read_dir()
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("trades_"));
        assert!(names[0].ends_with(".csv"));
    }
}
