// =============================================================================
// Exit Evaluator — prioritized decision list, evaluated every tick
// =============================================================================
//
// Priorities (top wins; the first matching rule fires and short-circuits):
//
//   1. Integrity guard      — invalid side/size or no usable price: HOLD and
//                             trigger reconciliation. PnL is never computed
//                             from a zero/None price.
//   2. Profit harvest       — PnL USD >= threshold for long enough, or the
//                             big-profit percent level: close.
//   3. Profit drawdown      — armed by peak USD profit; closes when PnL%
//                             retraces the regime-scaled fraction from peak.
//   4. Take profit (full)   — PnL% >= max(configured, ATR-derived) target.
//   5. Stop loss            — PnL% <= -effective stop.
//   6. Trailing stop        — armed at the activation PnL%; the floor only
//                             ever rises; violation closes.
//   7. Partial take-profit  — once per position, holding-time gated with
//                             adaptive reduction at high PnL.
//   8. Max holding time     — closes ONLY a profitable position; a losing
//                             one is held for the SL path to own the loss.
//   9. Adaptive extension   — one-time holding-cap extension in profit.
//
// PnL is ALWAYS margin-basis (`unrealized_usd / margin_used * 100`). The
// price basis is never mixed into a decision.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::params::ParameterSet;
use crate::position::Position;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// Price resolution
// ---------------------------------------------------------------------------

/// Where the evaluation price came from, ordered best-first. The engine
/// resolves through the whole chain before giving up:
/// WS tick -> last bar close -> REST mark -> REST last -> cached last ->
/// entry price (degraded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    WsTick,
    BarClose,
    RestMark,
    RestLast,
    CachedLast,
    EntryPrice,
}

/// Resolved evaluation price plus provenance.
#[derive(Debug, Clone, Copy)]
pub struct PriceContext {
    pub price: f64,
    pub source: PriceSource,
}

impl PriceContext {
    /// An entry-price fallback cannot produce meaningful PnL; exits other
    /// than the integrity path must not act on it.
    pub fn degraded(&self) -> bool {
        self.source == PriceSource::EntryPrice
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The single action selected for a position this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionAction {
    Hold,
    /// Integrity guard fired: hold and force a reconciliation pass.
    HoldAndReconcile { reason: String },
    CloseFull { reason: ExitReason },
    ClosePartial { fraction: f64 },
    /// One-time holding-cap extension was granted this tick.
    ExtendHolding,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Holding-time reduction ladder for the partial take-profit.
const ADAPTIVE_HOLDING_HALF_AT_PNL: f64 = 1.0;
const ADAPTIVE_HOLDING_THREE_QUARTERS_AT_PNL: f64 = 0.5;

pub struct ExitEvaluator;

impl ExitEvaluator {
    /// Evaluate one open position against the rule list.
    ///
    /// Mutates the position's peak/trailing bookkeeping; the returned action
    /// is executed by the caller (close via the exchange, then finalize in
    /// the registry).
    ///
    /// `atr_percent` is the current ATR as a percent of price, used for the
    /// ATR-derived TP/SL widths; `None` falls back to the configured
    /// percentages alone.
    pub fn evaluate(
        position: &mut Position,
        price_ctx: Option<PriceContext>,
        params: &ParameterSet,
        atr_percent: Option<f64>,
        now_ms: i64,
    ) -> PositionAction {
        // ── 1. Integrity guard ──────────────────────────────────────────
        if position.size_contracts <= 0.0 {
            return PositionAction::HoldAndReconcile {
                reason: format!("invalid position size {}", position.size_contracts),
            };
        }
        let ctx = match price_ctx {
            Some(ctx) if ctx.price > 0.0 => ctx,
            _ => {
                return PositionAction::HoldAndReconcile {
                    reason: "no usable price after full fallback chain".to_string(),
                }
            }
        };
        if ctx.degraded() {
            // Entry-price fallback: PnL would be identically zero. Hold and
            // let reconciliation confirm the real state.
            return PositionAction::HoldAndReconcile {
                reason: "price degraded to entry price".to_string(),
            };
        }
        if matches!(position.status, crate::position::PositionStatus::Closing) {
            // A close is already in flight; reconciliation owns the ack.
            return PositionAction::Hold;
        }

        let price = ctx.price;
        let pnl_pct = position.pnl_pct_from_margin(price);
        let pnl_usd = position.unrealized_usd(price);
        let holding_secs = position.holding_secs(now_ms);

        // ── Peak bookkeeping (monotone non-decreasing) ──────────────────
        if pnl_pct > position.peak_profit_pct {
            position.peak_profit_pct = pnl_pct;
        }
        if pnl_usd > position.peak_profit_usd {
            position.peak_profit_usd = pnl_usd;
        }

        // ── Trailing bookkeeping (rule 6 state; check happens below) ────
        let trailing = &params.trailing_stop;
        if trailing.enabled && !position.trailing_stop_active
            && pnl_pct >= trailing.activation_percent
        {
            position.trailing_stop_active = true;
            debug!(id = %position.id, pnl_pct, "trailing stop armed");
        }
        if position.trailing_stop_active {
            let candidate = position.peak_profit_pct - trailing.distance_percent;
            let level = position.trailing_stop_level.get_or_insert(candidate);
            // The floor only ever rises.
            if candidate > *level {
                *level = candidate;
            }
        }

        // ── 2. Profit harvest ───────────────────────────────────────────
        let harvest = &params.profit_harvest;
        if harvest.enabled {
            if pnl_usd >= harvest.threshold_usd && holding_secs >= harvest.time_limit_seconds {
                info!(
                    id = %position.id,
                    pnl_usd = format!("{:.2}", pnl_usd),
                    holding_secs,
                    "profit harvest triggered"
                );
                return PositionAction::CloseFull {
                    reason: ExitReason::ProfitHarvest,
                };
            }
            if pnl_pct >= harvest.big_profit_exit_percent {
                info!(id = %position.id, pnl_pct, "big-profit harvest triggered");
                return PositionAction::CloseFull {
                    reason: ExitReason::ProfitHarvest,
                };
            }
        }

        // ── 3. Profit drawdown ──────────────────────────────────────────
        let drawdown = &params.profit_drawdown;
        if position.peak_profit_usd >= drawdown.min_profit_to_activate_usd
            && position.peak_profit_pct > 0.0
        {
            let give_back = (drawdown.drawdown_percent * drawdown.multiplier).clamp(0.0, 1.0);
            let floor = position.peak_profit_pct * (1.0 - give_back);
            if pnl_pct < floor {
                info!(
                    id = %position.id,
                    peak = position.peak_profit_pct,
                    pnl_pct,
                    floor,
                    "profit drawdown triggered"
                );
                return PositionAction::CloseFull {
                    reason: ExitReason::ProfitDrawdown,
                };
            }
        }

        // ── 4. Take profit ──────────────────────────────────────────────
        let effective_tp = effective_target(
            params.tp_percent,
            atr_percent,
            params.tp_atr_mult,
            position.leverage,
        );
        if pnl_pct >= effective_tp {
            return PositionAction::CloseFull {
                reason: ExitReason::Tp,
            };
        }

        // ── 5. Stop loss ────────────────────────────────────────────────
        let effective_sl = effective_target(
            params.sl_percent,
            atr_percent,
            params.sl_atr_mult,
            position.leverage,
        );
        if pnl_pct <= -effective_sl {
            return PositionAction::CloseFull {
                reason: ExitReason::Sl,
            };
        }

        // ── 6. Trailing stop ────────────────────────────────────────────
        if position.trailing_stop_active {
            if let Some(level) = position.trailing_stop_level {
                if pnl_pct <= level {
                    return PositionAction::CloseFull {
                        reason: ExitReason::Trailing,
                    };
                }
            }
        }

        // ── 7. Partial take-profit ──────────────────────────────────────
        let partial = &params.partial_tp;
        if partial.enabled
            && !position.partial_tp_executed
            && pnl_pct >= partial.trigger_percent
            && holding_secs >= adaptive_min_holding(partial.min_holding_secs, pnl_pct)
        {
            return PositionAction::ClosePartial {
                fraction: partial.fraction,
            };
        }

        // ── 8/9. Max holding time & adaptive extension ──────────────────
        let cap_minutes = params.max_holding_minutes * if position.time_extended { 2 } else { 1 };
        if cap_minutes > 0 && holding_secs >= cap_minutes * 60 {
            if pnl_pct > 0.0 {
                if params.extend_time_if_profitable
                    && !position.time_extended
                    && pnl_pct >= params.min_profit_for_extension
                {
                    position.time_extended = true;
                    info!(id = %position.id, pnl_pct, "holding cap extended once");
                    return PositionAction::ExtendHolding;
                }
                return PositionAction::CloseFull {
                    reason: ExitReason::MaxHolding,
                };
            }
            // Losing position at timeout: a forced exit guarantees the loss
            // after fees. The SL path owns losses; hold.
            debug!(
                id = %position.id,
                pnl_pct,
                holding_secs,
                "max holding reached on losing position — holding"
            );
            return PositionAction::Hold;
        }

        PositionAction::Hold
    }
}

/// Margin-basis target from the configured percent and the ATR width.
/// `atr_percent` is price-basis, so it is converted via leverage before the
/// comparison — the two bases are never mixed.
fn effective_target(
    configured_pct: f64,
    atr_percent: Option<f64>,
    atr_mult: f64,
    leverage: u32,
) -> f64 {
    match atr_percent {
        Some(atr_pct) if atr_pct > 0.0 => {
            configured_pct.max(atr_pct * atr_mult * leverage.max(1) as f64)
        }
        _ => configured_pct,
    }
}

/// Holding-time requirement for the partial TP, reduced as profit grows:
/// 50% of the base at PnL% >= 1.0, 75% at PnL% >= 0.5.
fn adaptive_min_holding(base_secs: u64, pnl_pct: f64) -> u64 {
    if pnl_pct >= ADAPTIVE_HOLDING_HALF_AT_PNL {
        base_secs / 2
    } else if pnl_pct >= ADAPTIVE_HOLDING_THREE_QUARTERS_AT_PNL {
        base_secs * 3 / 4
    } else {
        base_secs
    }
}
