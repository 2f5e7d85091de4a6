// =============================================================================
// Central Engine State — Meridian Perp Scalper
// =============================================================================
//
// The single source of truth wiring every subsystem together. Subsystems are
// injected explicitly — no hidden globals; each manages its own interior
// mutability behind `Arc`.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for shared collections.
//   - A per-symbol tokio mutex serialises decision cycles so at most one
//     cycle runs for a given symbol at any moment.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::audit::DecisionRecord;
use crate::config::EngineConfig;
use crate::execution::EntryExecutor;
use crate::indicators::{IndicatorConfig, IndicatorEngine};
use crate::journal::Journal;
use crate::market_data::MarketDataRegistry;
use crate::okx::{AccountBalance, OkxClient, RateLimitTracker};
use crate::params::ParameterResolver;
use crate::position::PositionRegistry;
use crate::regime::RegimeClassifier;
use crate::risk::RiskGovernor;
use crate::sizing::KellyLedger;
use crate::types::{AccountMode, InstrumentSpec, TradingMode};

/// Bounded ring sizes for operator-visible history.
const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub at: String,
}

/// Central engine state shared across all tasks via `Arc<EngineState>`.
pub struct EngineState {
    /// Monotonically increasing version, bumped on meaningful mutations.
    pub state_version: AtomicU64,

    // ── Configuration (immutable snapshots via the resolver) ────────────
    pub resolver: ParameterResolver,
    pub trading_mode: RwLock<TradingMode>,
    pub account_mode: RwLock<AccountMode>,

    // ── Market data & analytics ─────────────────────────────────────────
    pub market: Arc<MarketDataRegistry>,
    pub indicators: Arc<IndicatorEngine>,
    pub regimes: Arc<RegimeClassifier>,

    // ── Trading pipeline ────────────────────────────────────────────────
    pub risk: Arc<RiskGovernor>,
    pub kelly: Arc<KellyLedger>,
    pub positions: Arc<PositionRegistry>,
    pub executor: EntryExecutor,

    // ── Exchange ────────────────────────────────────────────────────────
    pub client: Arc<OkxClient>,
    pub rate_limits: Arc<RateLimitTracker>,
    pub instruments: RwLock<HashMap<String, InstrumentSpec>>,
    pub account: RwLock<AccountBalance>,

    // ── Telemetry ───────────────────────────────────────────────────────
    pub journal: Journal,
    pub recent_decisions: RwLock<Vec<DecisionRecord>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    // ── Scheduling ──────────────────────────────────────────────────────
    /// Wakes the reconciliation loop early (integrity guard, invariant
    /// violations).
    pub reconcile_notify: Notify,
    symbol_locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Wire up all subsystems from the loaded configuration.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let now_ms = Utc::now().timestamp_millis();

        let api_key = std::env::var("OKX_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("OKX_API_SECRET").unwrap_or_default();
        let passphrase = std::env::var("OKX_PASSPHRASE").unwrap_or_default();

        let client = Arc::new(OkxClient::new(
            api_key,
            api_secret,
            passphrase,
            config.api.okx.sandbox,
            config.execution.default_leverage_steps.clone(),
        ));

        let market = Arc::new(MarketDataRegistry::new(config.freshness_window_secs));
        let positions = Arc::new(PositionRegistry::new());
        let rate_limits = Arc::new(RateLimitTracker::new());
        let risk = Arc::new(RiskGovernor::new(config.risk.clone(), now_ms));
        let regimes = Arc::new(RegimeClassifier::new(config.regime.clone()));
        let journal = Journal::new(&config.journal_dir)?;

        let executor = EntryExecutor::new(
            client.clone(),
            positions.clone(),
            rate_limits.clone(),
            config.execution.clone(),
        );

        let trading_mode = config.trading_mode;
        let account_mode = config.account_mode;

        Ok(Self {
            state_version: AtomicU64::new(1),
            resolver: ParameterResolver::new(config),
            trading_mode: RwLock::new(trading_mode),
            account_mode: RwLock::new(account_mode),
            market,
            indicators: Arc::new(IndicatorEngine::new(IndicatorConfig::default())),
            regimes,
            risk,
            kelly: Arc::new(KellyLedger::new()),
            positions,
            executor,
            client,
            rate_limits,
            instruments: RwLock::new(HashMap::new()),
            account: RwLock::new(AccountBalance {
                total_equity: 0.0,
                available_margin: 0.0,
            }),
            journal,
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            reconcile_notify: Notify::new(),
            symbol_locks: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Per-symbol serialisation ────────────────────────────────────────

    /// The lock guarding this symbol's decision cycle. At most one cycle
    /// may execute per symbol at any moment.
    pub fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.symbol_locks.read().get(symbol) {
            return lock.clone();
        }
        self.symbol_locks
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Rings ───────────────────────────────────────────────────────────

    pub fn push_decision(&self, record: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(record);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Convenience reads ───────────────────────────────────────────────

    pub fn equity(&self) -> f64 {
        self.account.read().total_equity
    }

    pub fn free_margin(&self) -> f64 {
        self.account.read().available_margin
    }

    pub fn instrument(&self, symbol: &str) -> Option<InstrumentSpec> {
        self.instruments.read().get(symbol).cloned()
    }

    /// Build a serialisable status snapshot for periodic operator logging.
    pub fn snapshot(&self) -> EngineSnapshot {
        let now_ms = Utc::now().timestamp_millis();
        let risk = self.risk.snapshot(now_ms);
        let open = self.positions.all_open();

        EngineSnapshot {
            state_version: self.current_version(),
            server_time: now_ms,
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: self.trading_mode.read().to_string(),
            account_mode: self.account_mode.read().to_string(),
            equity: self.equity(),
            open_positions: open.len(),
            daily_pnl: risk.daily_pnl,
            daily_trades: risk.daily_trades,
            daily_loss_halt: risk.daily_loss_triggered,
            reconcile_ok_age_secs: self
                .last_reconcile_ok
                .read()
                .map(|t| t.elapsed().as_secs()),
            reconcile_last_error: self.last_reconcile_error.read().clone(),
        }
    }
}

/// Periodic status snapshot; logged, not served.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub equity: f64,
    pub open_positions: usize,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub daily_loss_halt: bool,
    pub reconcile_ok_age_secs: Option<u64>,
    pub reconcile_last_error: Option<String>,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("version", &self.current_version())
            .field("open_positions", &self.positions.open_count())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EngineState {
        let mut config = EngineConfig::default();
        config.journal_dir = tempfile::tempdir()
            .unwrap()
            .into_path()
            .to_string_lossy()
            .into_owned();
        EngineState::new(config).unwrap()
    }

    #[test]
    fn decision_ring_is_bounded() {
        let s = state();
        for i in 0..150 {
            s.push_decision(DecisionRecord::blocked(
                "BTC-USDT-SWAP",
                "long",
                "test",
                format!("reason {i}"),
            ));
        }
        assert_eq!(s.recent_decisions.read().len(), MAX_RECENT_DECISIONS);
    }

    #[test]
    fn error_ring_is_bounded() {
        let s = state();
        for i in 0..80 {
            s.push_error(format!("err {i}"), None);
        }
        assert_eq!(s.recent_errors.read().len(), MAX_RECENT_ERRORS);
    }

    #[test]
    fn version_increments() {
        let s = state();
        let before = s.current_version();
        s.increment_version();
        assert_eq!(s.current_version(), before + 1);
    }

    #[test]
    fn symbol_lock_is_shared_per_symbol() {
        let s = state();
        let a = s.symbol_lock("BTC-USDT-SWAP");
        let b = s.symbol_lock("BTC-USDT-SWAP");
        let c = s.symbol_lock("ETH-USDT-SWAP");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn snapshot_reflects_safe_startup() {
        let s = state();
        let snap = s.snapshot();
        assert_eq!(snap.trading_mode, "Paused");
        assert_eq!(snap.account_mode, "Demo");
        assert_eq!(snap.open_positions, 0);
        assert!(!snap.daily_loss_halt);
    }
}
