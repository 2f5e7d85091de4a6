// =============================================================================
// Position Module — model, registry, and per-position exit state machine
// =============================================================================
//
// Life-cycle:
//   Created -> Entered -> (Active <-> PartialTp) -> Closing -> Closed
//
// A position is exclusively owned by the registry from entry-ack until the
// close is acknowledged. It is NEVER silently dropped on transport failure:
// a timed-out close leaves the position in Closing for reconciliation to
// confirm.

pub mod manager;

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::regime::Regime;
use crate::types::{ExitReason, Side, TradeResult};

pub use manager::{ExitEvaluator, PositionAction, PriceContext, PriceSource};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Created,
    Entered,
    Active,
    PartialTp,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Entered => write!(f, "Entered"),
            Self::Active => write!(f, "Active"),
            Self::PartialTp => write!(f, "PartialTp"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// One tracked perpetual position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Remaining open contracts (reduced by partial closes).
    pub size_contracts: f64,
    pub leverage: u32,
    /// Margin deployed, USD. Estimated as notional/leverage when the venue
    /// does not report it (see `margin_estimated`).
    pub margin_used: f64,
    pub margin_estimated: bool,
    /// Base units per contract, snapshotted from the instrument at entry.
    pub contract_value: f64,
    pub entry_time_ms: i64,
    pub regime_at_entry: Regime,
    pub status: PositionStatus,
    /// Monotone non-decreasing per position.
    pub peak_profit_pct: f64,
    pub peak_profit_usd: f64,
    /// One-way flag; set by the first (and only) partial take-profit.
    pub partial_tp_executed: bool,
    pub trailing_stop_active: bool,
    /// Margin-basis PnL percent floor maintained by the trailing stop.
    pub trailing_stop_level: Option<f64>,
    pub scale_additions: u32,
    pub time_extended: bool,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    /// Reason the in-flight close was initiated with; consumed when
    /// reconciliation confirms the exchange is flat.
    pub pending_close_reason: Option<ExitReason>,
    /// Realised PnL accumulated by partial closes, USD.
    pub realized_pnl: f64,
    /// True when adopted from the exchange by reconciliation.
    pub adopted: bool,
}

impl Position {
    /// Build a freshly entered position.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        side: Side,
        entry_price: f64,
        size_contracts: f64,
        leverage: u32,
        margin_used: Option<f64>,
        contract_value: f64,
        regime_at_entry: Regime,
        entry_time_ms: i64,
    ) -> Self {
        let notional = size_contracts * contract_value * entry_price;
        let (margin, estimated) = match margin_used {
            Some(m) if m > 0.0 => (m, false),
            _ => (notional / leverage.max(1) as f64, true),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            size_contracts,
            leverage,
            margin_used: margin,
            margin_estimated: estimated,
            contract_value,
            entry_time_ms,
            regime_at_entry,
            status: PositionStatus::Entered,
            peak_profit_pct: 0.0,
            peak_profit_usd: 0.0,
            partial_tp_executed: false,
            trailing_stop_active: false,
            trailing_stop_level: None,
            scale_additions: 0,
            time_extended: false,
            tp_order_id: None,
            sl_order_id: None,
            pending_close_reason: None,
            realized_pnl: 0.0,
            adopted: false,
        }
    }

    /// Unrealised PnL in USD at `price`.
    pub fn unrealized_usd(&self, price: f64) -> f64 {
        self.side.direction() * (price - self.entry_price) * self.size_contracts
            * self.contract_value
    }

    /// Margin-basis PnL percent: `unrealized / margin_used * 100`. This is
    /// the ONLY PnL percentage the exit rules reason about; price-change
    /// percent never leaks into a decision.
    pub fn pnl_pct_from_margin(&self, price: f64) -> f64 {
        if self.margin_used <= 0.0 {
            return 0.0;
        }
        self.unrealized_usd(price) / self.margin_used * 100.0
    }

    pub fn notional_usd(&self, price: f64) -> f64 {
        self.size_contracts * self.contract_value * price
    }

    pub fn holding_secs(&self, now_ms: i64) -> u64 {
        ((now_ms - self.entry_time_ms).max(0) / 1000) as u64
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.status, PositionStatus::Closed)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns every live position. All mutation goes through this typed API; a
/// per-symbol lock serialises state-machine transitions so the rest of the
/// engine observes them atomically.
pub struct PositionRegistry {
    books: RwLock<HashMap<String, std::sync::Arc<Mutex<Vec<Position>>>>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    fn book(&self, symbol: &str) -> std::sync::Arc<Mutex<Vec<Position>>> {
        if let Some(book) = self.books.read().get(symbol) {
            return book.clone();
        }
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Register a freshly entered position and return its id.
    pub fn register(&self, mut position: Position) -> String {
        position.status = PositionStatus::Active;
        let id = position.id.clone();
        info!(
            id = %id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price = position.entry_price,
            size = position.size_contracts,
            leverage = position.leverage,
            margin = format!("{:.2}", position.margin_used),
            adopted = position.adopted,
            "position registered"
        );
        self.book(&position.symbol).lock().push(position);
        id
    }

    /// Snapshot of open positions for one symbol.
    pub fn open_for(&self, symbol: &str) -> Vec<Position> {
        self.book(symbol).lock().clone()
    }

    /// Snapshot of every open position.
    pub fn all_open(&self) -> Vec<Position> {
        let books = self.books.read();
        books
            .values()
            .flat_map(|b| b.lock().clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.books.read().values().map(|b| b.lock().len()).sum()
    }

    /// Symbols that currently hold at least one open position.
    pub fn symbols_with_positions(&self) -> Vec<String> {
        self.books
            .read()
            .iter()
            .filter(|(_, b)| !b.lock().is_empty())
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Apply `mutate` to the open position `id` under the symbol lock.
    pub fn with_position<R>(
        &self,
        symbol: &str,
        id: &str,
        mutate: impl FnOnce(&mut Position) -> R,
    ) -> Option<R> {
        let book = self.book(symbol);
        let mut positions = book.lock();
        positions.iter_mut().find(|p| p.id == id).map(mutate)
    }

    /// Transition a position to Closing before the exchange close call. A
    /// position already Closing stays Closing (retried closes are fine).
    pub fn begin_close(&self, symbol: &str, id: &str, reason: ExitReason) -> bool {
        self.with_position(symbol, id, |p| {
            p.status = PositionStatus::Closing;
            p.pending_close_reason = Some(reason);
        })
        .is_some()
    }

    /// Finalize a FULL close: remove from the open book, emit exactly one
    /// [`TradeResult`] for the remaining size.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_close(
        &self,
        symbol: &str,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        commission: f64,
        funding_fee: f64,
        now_ms: i64,
    ) -> Option<TradeResult> {
        let book = self.book(symbol);
        let mut positions = book.lock();
        let idx = positions.iter().position(|p| p.id == id)?;
        let mut position = positions.remove(idx);

        let gross = position.unrealized_usd(exit_price);
        let net = TradeResult::net_from_parts(gross, commission, funding_fee);

        let result = TradeResult {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size_contracts: position.size_contracts,
            gross_pnl: gross,
            commission,
            funding_fee,
            net_pnl: net,
            duration_seconds: position.holding_secs(now_ms) as i64,
            exit_reason: reason,
            regime_at_entry: position.regime_at_entry.to_string(),
            closed_at: Utc::now().to_rfc3339(),
        };

        position.realized_pnl += net;
        position.status = PositionStatus::Closed;
        position.size_contracts = 0.0;

        info!(
            id = %id,
            symbol,
            reason = %reason,
            exit_price,
            net_pnl = format!("{:.4}", net),
            "position closed"
        );

        self.closed.write().push(position);
        Some(result)
    }

    /// Execute a partial close: reduce size, set the one-way flag, emit the
    /// partial [`TradeResult`]. Returns `None` if the position is missing or
    /// the partial already happened.
    pub fn apply_partial_close(
        &self,
        symbol: &str,
        id: &str,
        fraction: f64,
        exit_price: f64,
        commission: f64,
        now_ms: i64,
    ) -> Option<TradeResult> {
        let book = self.book(symbol);
        let mut positions = book.lock();
        let position = positions.iter_mut().find(|p| p.id == id)?;

        if position.partial_tp_executed {
            warn!(id = %id, "partial TP already executed — refusing a second");
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction <= 0.0 || fraction >= 1.0 {
            return None;
        }

        let closed_contracts = position.size_contracts * fraction;
        let gross = position.side.direction()
            * (exit_price - position.entry_price)
            * closed_contracts
            * position.contract_value;
        let net = TradeResult::net_from_parts(gross, commission, 0.0);

        position.size_contracts -= closed_contracts;
        // Margin shrinks proportionally so margin-basis PnL stays coherent
        // for the remainder.
        position.margin_used *= 1.0 - fraction;
        position.realized_pnl += net;
        position.partial_tp_executed = true;
        position.status = PositionStatus::PartialTp;

        info!(
            id = %id,
            symbol,
            closed_contracts,
            remaining = position.size_contracts,
            net_pnl = format!("{:.4}", net),
            "partial take-profit executed"
        );

        Some(TradeResult {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size_contracts: closed_contracts,
            gross_pnl: gross,
            commission,
            funding_fee: 0.0,
            net_pnl: net,
            duration_seconds: position.holding_secs(now_ms) as i64,
            exit_reason: ExitReason::PartialTpRemainder,
            regime_at_entry: position.regime_at_entry.to_string(),
            closed_at: Utc::now().to_rfc3339(),
        })
    }

    /// Scale into an existing position: volume-weighted entry, summed size
    /// and margin. The position keeps its EXISTING leverage.
    pub fn apply_scale_in(
        &self,
        symbol: &str,
        id: &str,
        add_contracts: f64,
        add_price: f64,
        add_margin: f64,
    ) -> bool {
        self.with_position(symbol, id, |p| {
            let old_notional = p.size_contracts * p.entry_price;
            let add_notional = add_contracts * add_price;
            let total = p.size_contracts + add_contracts;
            if total > 0.0 {
                p.entry_price = (old_notional + add_notional) / total;
            }
            p.size_contracts = total;
            p.margin_used += add_margin;
            p.scale_additions += 1;
        })
        .is_some()
    }

    /// Recent closed positions, newest first.
    pub fn closed(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionRegistry")
            .field("open", &self.open_count())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}
