// =============================================================================
// Decision Engine — per-symbol entry and exit cycles
// =============================================================================
//
// Within a symbol the order is strictly sequential: ingest tick ->
// recompute indicators -> classify regime -> score signal -> evaluate
// exits. Across symbols there is no ordering guarantee; the per-symbol lock
// in EngineState keeps at most one cycle running per symbol.
//
// Stale market data vetoes NEW entries only — exits are still serviced from
// the freshest data the price-fallback chain can find.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::app_state::EngineState;
use crate::audit::DecisionRecord;
use crate::error::EngineError;
use crate::execution::ExecutionResult;
use crate::filters::{FilterContext, FilterPipeline};
use crate::journal::{OrderRecord, SignalRecord};
use crate::market_data::Timeframe;
use crate::okx::{OrderType, TimeInForce};
use crate::position::{
    ExitEvaluator, Position, PositionAction, PriceContext, PriceSource,
};
use crate::regime::Regime;
use crate::signals::{Signal, SignalGenerator};
use crate::sizing::{LeverageSelector, PositionSizer, SizingReject};
use crate::types::{AccountMode, ExitReason, TradingMode};

/// Taker fee estimate used when the venue has not reported commissions yet.
// TODO: replace with the venue's fill-report fee once order fills are
// streamed through the private channel.
const TAKER_FEE_RATE: f64 = 0.0005;
/// Closed bars fetched for the decision timeframe.
const DECISION_LOOKBACK: usize = 120;
/// Scale-ins allowed per position.
const MAX_SCALE_ADDITIONS: u32 = 1;
/// Equity assumed before the first balance fetch (demo sessions).
const FALLBACK_EQUITY_USD: f64 = 1_000.0;

pub struct DecisionEngine;

impl DecisionEngine {
    /// Run one full cycle for `symbol`: entry evaluation, then exits.
    /// Callers must hold the symbol lock.
    pub async fn run_symbol_cycle(state: &Arc<EngineState>, symbol: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let record = Self::evaluate_entry(state, symbol, now_ms).await;
        state.push_decision(record);
        Self::evaluate_exits(state, symbol, now_ms).await;
    }

    // =========================================================================
    // Entry side
    // =========================================================================

    pub async fn evaluate_entry(
        state: &Arc<EngineState>,
        symbol: &str,
        now_ms: i64,
    ) -> DecisionRecord {
        // ── Mode gate ───────────────────────────────────────────────────
        let trading_mode = *state.trading_mode.read();
        if trading_mode != TradingMode::Live {
            return DecisionRecord::blocked(
                symbol,
                "none",
                "mode",
                format!("trading mode is {trading_mode}"),
            );
        }

        // ── 1. Fresh tick (stale data vetoes entries) ───────────────────
        let fresh = match state.market.get_tick_at(symbol, now_ms) {
            Some(f) => f,
            None => {
                return DecisionRecord::blocked(symbol, "none", "data", "no tick received yet")
            }
        };
        if fresh.stale {
            let err = EngineError::StaleData {
                symbol: symbol.to_string(),
                age_secs: fresh.age_secs,
            };
            debug!(symbol, age_secs = fresh.age_secs, "stale feed — entry vetoed");
            return DecisionRecord::blocked(symbol, "none", "data", err.to_string());
        }
        let tick = fresh.tick;

        // ── 2. Indicators on the decision timeframe ─────────────────────
        let bars = state.market.get_bars(symbol, Timeframe::M5, DECISION_LOOKBACK);
        let equity = effective_equity(state);
        let prior_regime = state
            .regimes
            .current(symbol)
            .map(|r| r.regime)
            .unwrap_or(Regime::Ranging);
        let pre_params = state.resolver.resolve(symbol, prior_regime, equity);

        let snapshot = match state.indicators.update(
            symbol,
            Timeframe::M5,
            &bars,
            Some(tick.last),
            pre_params.ema_fast_period,
            pre_params.ema_slow_period,
        ) {
            Some(s) => s,
            None => {
                return DecisionRecord::blocked(
                    symbol,
                    "none",
                    "indicators",
                    format!("insufficient history ({} bars)", bars.len()),
                )
            }
        };

        // ── 3. Regime classification (with hysteresis) ──────────────────
        let update = state.regimes.observe(symbol, &snapshot, now_ms);
        if update.switched {
            // Regime-conditioned smoothing must not leak across the switch.
            state.indicators.reset_symbol(symbol);
            state.resolver.invalidate_symbol(symbol);
            state.increment_version();
        }
        let reading = update.reading;
        let params = state.resolver.resolve(symbol, reading.regime, equity);

        // ── 4. Signal generation ────────────────────────────────────────
        let output = SignalGenerator::evaluate(
            symbol,
            &snapshot,
            bars.last(),
            &reading,
            &params,
            now_ms,
        );

        for rejection in &output.rejections {
            journal_signal(
                state,
                symbol,
                &rejection.side.to_string(),
                snapshot.last_price,
                rejection.score / crate::signals::generator::MAX_SCORE,
                reading.regime,
                "",
                false,
                &format!("signal_generator: {}", rejection.reason),
                "",
            );
        }

        let mut signal = match output.signal {
            Some(s) => s,
            None => {
                let reason = output
                    .rejections
                    .first()
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| "no detector fired".to_string());
                return DecisionRecord::blocked(symbol, "none", "signal", reason);
            }
        };

        // ── 5. Filter pipeline ──────────────────────────────────────────
        let open_symbols = state.positions.symbols_with_positions();
        let outcome = {
            let ctx = FilterContext {
                registry: state.market.as_ref(),
                params: &params,
                snapshot: &snapshot,
                open_symbols: &open_symbols,
            };
            FilterPipeline::run(&mut signal, &ctx)
        };
        if !outcome.allowed {
            let stage = outcome
                .rejected_by
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            journal_signal(
                state,
                symbol,
                &signal.side.to_string(),
                signal.reference_price,
                signal.strength,
                signal.regime,
                &signal.filters_passed.join(";"),
                false,
                &format!("filters/{stage}"),
                "",
            );
            return DecisionRecord::blocked(symbol, signal.side.to_string(), "filters", outcome.reason);
        }

        // ── 6. Risk governor ────────────────────────────────────────────
        if let Err(refusal) = state.risk.admit(
            symbol,
            equity,
            state.positions.open_count() as u32,
            params.max_open_positions,
            now_ms,
        ) {
            journal_signal(
                state,
                symbol,
                &signal.side.to_string(),
                signal.reference_price,
                signal.strength,
                signal.regime,
                &signal.filters_passed.join(";"),
                false,
                "risk_governor",
                "",
            );
            return DecisionRecord::blocked(
                symbol,
                signal.side.to_string(),
                "risk",
                refusal.to_string(),
            );
        }

        // ── 7. Sizing & execution ───────────────────────────────────────
        let instrument = match state.instrument(symbol) {
            Some(i) => i,
            None => {
                return DecisionRecord::blocked(
                    symbol,
                    signal.side.to_string(),
                    "sizing",
                    "instrument details unavailable",
                )
            }
        };

        // Scaling an existing same-side position reuses ITS leverage; a
        // fresh entry selects one from strength/regime/volatility.
        let existing = state
            .positions
            .open_for(symbol)
            .into_iter()
            .next();

        if let Some(existing) = existing {
            return Self::try_scale_in(state, &signal, existing, &instrument, &params, equity)
                .await;
        }

        let desired = LeverageSelector::desired(
            signal.strength,
            reading.regime,
            snapshot.volatility_percent,
        );
        let leverage = LeverageSelector::select(desired, &instrument);

        let kelly_factor =
            state
                .kelly
                .factor(symbol, reading.regime, &state.resolver.config().kelly);
        let config = state.resolver.config();
        let order = match PositionSizer::size(
            &params,
            &instrument,
            equity,
            signal.reference_price,
            signal.strength,
            kelly_factor,
            leverage,
            effective_free_margin(state),
            config.execution.margin_buffer_percent,
        ) {
            Ok(order) => order,
            Err(reject) => {
                journal_signal(
                    state,
                    symbol,
                    &signal.side.to_string(),
                    signal.reference_price,
                    signal.strength,
                    signal.regime,
                    &signal.filters_passed.join(";"),
                    false,
                    "position_sizer",
                    "",
                );
                let stage = match reject {
                    SizingReject::InsufficientMargin { .. } => "margin",
                    _ => "sizing",
                };
                return DecisionRecord::blocked(
                    symbol,
                    signal.side.to_string(),
                    stage,
                    reject.to_string(),
                );
            }
        };

        let account_mode = *state.account_mode.read();
        let result = state
            .executor
            .execute_entry(&signal, &order, &instrument, reading.regime, account_mode)
            .await;

        Self::record_entry_outcome(state, &signal, order.contracts, result)
    }

    /// Journal the executed/failed entry and build the decision record.
    fn record_entry_outcome(
        state: &Arc<EngineState>,
        signal: &Signal,
        contracts: f64,
        result: ExecutionResult,
    ) -> DecisionRecord {
        match result {
            ExecutionResult::Placed {
                ref order_id,
                fill_price,
                fill_contracts,
                ..
            } => {
                let slippage = fill_price - signal.reference_price;
                journal_order(
                    state,
                    signal,
                    OrderType::Limit,
                    contracts,
                    Some(signal.reference_price),
                    "filled",
                    fill_price,
                    fill_contracts,
                    slippage,
                    order_id,
                );
                journal_signal(
                    state,
                    &signal.symbol,
                    &signal.side.to_string(),
                    signal.reference_price,
                    signal.strength,
                    signal.regime,
                    &signal.filters_passed.join(";"),
                    true,
                    "",
                    order_id,
                );
                DecisionRecord::allow(
                    &signal.symbol,
                    signal.side.to_string(),
                    signal.score,
                    &signal.regime.to_string(),
                )
            }
            ExecutionResult::Simulated { ref position_id } => {
                journal_order(
                    state,
                    signal,
                    OrderType::Limit,
                    contracts,
                    Some(signal.reference_price),
                    "simulated",
                    signal.reference_price,
                    contracts,
                    0.0,
                    position_id,
                );
                journal_signal(
                    state,
                    &signal.symbol,
                    &signal.side.to_string(),
                    signal.reference_price,
                    signal.strength,
                    signal.regime,
                    &signal.filters_passed.join(";"),
                    true,
                    "",
                    position_id,
                );
                DecisionRecord::allow(
                    &signal.symbol,
                    signal.side.to_string(),
                    signal.score,
                    &signal.regime.to_string(),
                )
            }
            ExecutionResult::Duplicate { fingerprint } => DecisionRecord::blocked(
                &signal.symbol,
                signal.side.to_string(),
                "execution",
                format!("duplicate entry suppressed ({fingerprint})"),
            ),
            ExecutionResult::Expired { order_id } => {
                journal_order(
                    state,
                    signal,
                    OrderType::Limit,
                    contracts,
                    Some(signal.reference_price),
                    "expired",
                    0.0,
                    0.0,
                    0.0,
                    &order_id,
                );
                DecisionRecord::blocked(
                    &signal.symbol,
                    signal.side.to_string(),
                    "execution",
                    "limit order expired unfilled",
                )
            }
            ExecutionResult::Blocked(reason) => DecisionRecord::blocked(
                &signal.symbol,
                signal.side.to_string(),
                "execution",
                reason,
            ),
            ExecutionResult::Failed(err) => {
                if matches!(err, EngineError::RejectTechnical { .. }) {
                    state
                        .risk
                        .record_technical_error(&signal.symbol, &err.to_string());
                }
                journal_signal(
                    state,
                    &signal.symbol,
                    &signal.side.to_string(),
                    signal.reference_price,
                    signal.strength,
                    signal.regime,
                    &signal.filters_passed.join(";"),
                    false,
                    "entry_executor",
                    "",
                );
                state.push_error(err.to_string(), None);
                DecisionRecord::blocked(
                    &signal.symbol,
                    signal.side.to_string(),
                    "execution",
                    err.to_string(),
                )
            }
        }
    }

    /// Add to an existing same-side position at its EXISTING leverage.
    async fn try_scale_in(
        state: &Arc<EngineState>,
        signal: &Signal,
        existing: Position,
        instrument: &crate::types::InstrumentSpec,
        params: &crate::params::ParameterSet,
        equity: f64,
    ) -> DecisionRecord {
        if matches!(existing.status, crate::position::PositionStatus::Closing) {
            return DecisionRecord::blocked(
                &signal.symbol,
                signal.side.to_string(),
                "position",
                "close in flight for this symbol",
            );
        }
        if existing.side != signal.side {
            return DecisionRecord::blocked(
                &signal.symbol,
                signal.side.to_string(),
                "position",
                format!("open {} position blocks a {} entry", existing.side, signal.side),
            );
        }
        if existing.scale_additions >= MAX_SCALE_ADDITIONS {
            return DecisionRecord::blocked(
                &signal.symbol,
                signal.side.to_string(),
                "position",
                "scale-in limit reached",
            );
        }

        let config = state.resolver.config();
        let kelly_factor = state
            .kelly
            .factor(&signal.symbol, signal.regime, &config.kelly);
        let order = match PositionSizer::size(
            params,
            instrument,
            equity,
            signal.reference_price,
            signal.strength,
            kelly_factor,
            existing.leverage,
            effective_free_margin(state),
            config.execution.margin_buffer_percent,
        ) {
            Ok(order) => order,
            Err(reject) => {
                return DecisionRecord::blocked(
                    &signal.symbol,
                    signal.side.to_string(),
                    "sizing",
                    reject.to_string(),
                )
            }
        };

        if *state.account_mode.read() == AccountMode::Live {
            match state
                .client
                .place_order(
                    &signal.symbol,
                    signal.side,
                    OrderType::Market,
                    order.contracts,
                    None,
                    false,
                    TimeInForce::Ioc,
                    None,
                )
                .await
            {
                Ok(ack) => {
                    journal_order(
                        state,
                        signal,
                        OrderType::Market,
                        order.contracts,
                        None,
                        "filled",
                        signal.reference_price,
                        order.contracts,
                        0.0,
                        &ack.order_id,
                    );
                }
                Err(e) => {
                    if matches!(e, EngineError::RejectTechnical { .. }) {
                        state
                            .risk
                            .record_technical_error(&signal.symbol, &e.to_string());
                    }
                    return DecisionRecord::blocked(
                        &signal.symbol,
                        signal.side.to_string(),
                        "execution",
                        e.to_string(),
                    );
                }
            }
        }

        state.positions.apply_scale_in(
            &signal.symbol,
            &existing.id,
            order.contracts,
            signal.reference_price,
            order.margin_required,
        );
        info!(
            symbol = %signal.symbol,
            position_id = %existing.id,
            added = order.contracts,
            leverage = existing.leverage,
            "scaled into existing position"
        );
        DecisionRecord::allow(
            &signal.symbol,
            signal.side.to_string(),
            signal.score,
            &signal.regime.to_string(),
        )
    }

    // =========================================================================
    // Exit side
    // =========================================================================

    pub async fn evaluate_exits(state: &Arc<EngineState>, symbol: &str, now_ms: i64) {
        let open = state.positions.open_for(symbol);
        if open.is_empty() {
            return;
        }

        let price_ctx = Self::resolve_price(state, symbol, now_ms).await;
        let regime = state
            .regimes
            .current(symbol)
            .map(|r| r.regime)
            .unwrap_or(Regime::Ranging);
        let params = state
            .resolver
            .resolve(symbol, regime, effective_equity(state));
        let atr_percent = state
            .indicators
            .snapshot(symbol, Timeframe::M5)
            .map(|s| s.volatility_percent);

        for position in open {
            // Evaluate under the symbol's position lock so bookkeeping
            // mutations are atomic.
            let action = state.positions.with_position(symbol, &position.id, |p| {
                ExitEvaluator::evaluate(p, price_ctx, &params, atr_percent, now_ms)
            });
            let Some(action) = action else { continue };

            match action {
                PositionAction::Hold | PositionAction::ExtendHolding => {}
                PositionAction::HoldAndReconcile { reason } => {
                    warn!(
                        symbol,
                        position_id = %position.id,
                        reason = %reason,
                        "integrity guard fired — requesting reconciliation"
                    );
                    state.reconcile_notify.notify_one();
                }
                PositionAction::CloseFull { reason } => {
                    let price = price_ctx.map(|c| c.price).unwrap_or(position.entry_price);
                    Self::close_full(state, &position, price, reason, now_ms).await;
                }
                PositionAction::ClosePartial { fraction } => {
                    let price = price_ctx.map(|c| c.price).unwrap_or(position.entry_price);
                    Self::close_partial(state, &position, fraction, price, now_ms).await;
                }
            }
        }
    }

    /// Full close: Closing transition, venue call in live mode, finalize,
    /// journal, risk/Kelly bookkeeping. A failed venue call leaves the
    /// position in Closing — silent deletion is forbidden.
    async fn close_full(
        state: &Arc<EngineState>,
        position: &Position,
        price: f64,
        reason: ExitReason,
        now_ms: i64,
    ) {
        state
            .positions
            .begin_close(&position.symbol, &position.id, reason);

        if *state.account_mode.read() == AccountMode::Live {
            let result = state
                .client
                .place_order(
                    &position.symbol,
                    position.side.opposite(),
                    OrderType::Market,
                    position.size_contracts,
                    None,
                    true,
                    TimeInForce::Ioc,
                    None,
                )
                .await;
            if let Err(e) = result {
                warn!(
                    symbol = %position.symbol,
                    position_id = %position.id,
                    error = %e,
                    "close order failed — position stays Closing for reconciliation"
                );
                state.push_error(e.to_string(), None);
                state.reconcile_notify.notify_one();
                return;
            }
        }

        let commission = position.notional_usd(price) * TAKER_FEE_RATE;
        if let Some(result) = state.positions.finalize_close(
            &position.symbol,
            &position.id,
            price,
            reason,
            commission,
            0.0,
            now_ms,
        ) {
            if let Err(e) = state.journal.append_trade(&result) {
                state.push_error(format!("trade journal write failed: {e}"), None);
            }
            state
                .risk
                .record_close(&position.symbol, result.net_pnl, now_ms);
            state
                .kelly
                .record(&position.symbol, position.regime_at_entry, result.net_pnl);
            state.increment_version();
        }
    }

    /// Partial close of `fraction`; the remainder continues under the full
    /// exit ruleset.
    async fn close_partial(
        state: &Arc<EngineState>,
        position: &Position,
        fraction: f64,
        price: f64,
        now_ms: i64,
    ) {
        let close_contracts = position.size_contracts * fraction;

        if *state.account_mode.read() == AccountMode::Live {
            let result = state
                .client
                .place_order(
                    &position.symbol,
                    position.side.opposite(),
                    OrderType::Market,
                    close_contracts,
                    None,
                    true,
                    TimeInForce::Ioc,
                    None,
                )
                .await;
            if let Err(e) = result {
                warn!(
                    symbol = %position.symbol,
                    position_id = %position.id,
                    error = %e,
                    "partial close order failed — flag stays unset for retry"
                );
                state.push_error(e.to_string(), None);
                return;
            }
        }

        let commission = close_contracts * position.contract_value * price * TAKER_FEE_RATE;
        if let Some(result) = state.positions.apply_partial_close(
            &position.symbol,
            &position.id,
            fraction,
            price,
            commission,
            now_ms,
        ) {
            if let Err(e) = state.journal.append_trade(&result) {
                state.push_error(format!("trade journal write failed: {e}"), None);
            }
            state
                .risk
                .record_close(&position.symbol, result.net_pnl, now_ms);
            state
                .kelly
                .record(&position.symbol, position.regime_at_entry, result.net_pnl);
            state.increment_version();
        }
    }

    // =========================================================================
    // Price fallback chain
    // =========================================================================

    /// Resolve the evaluation price through the full 5-level chain:
    /// WS tick -> last bar close -> REST mark -> REST last -> cached last.
    /// `None` lets the evaluator fall through to the degraded entry-price
    /// guard.
    pub async fn resolve_price(
        state: &Arc<EngineState>,
        symbol: &str,
        now_ms: i64,
    ) -> Option<PriceContext> {
        // 1. Fresh WS tick.
        let cached = state.market.get_tick_at(symbol, now_ms);
        if let Some(fresh) = &cached {
            if !fresh.stale && fresh.tick.last > 0.0 {
                return Some(PriceContext {
                    price: fresh.tick.last,
                    source: PriceSource::WsTick,
                });
            }
        }

        // 2. Last closed 1m bar.
        if let Some(close) = state.market.last_close(symbol, Timeframe::M1) {
            if close > 0.0 {
                return Some(PriceContext {
                    price: close,
                    source: PriceSource::BarClose,
                });
            }
        }

        // 3/4. REST fallbacks. Demo sessions never touch the venue; their
        // chain ends at the cached tick.
        if *state.account_mode.read() == AccountMode::Live {
            match state.client.get_mark_price(symbol).await {
                Ok(mark) if mark > 0.0 => {
                    return Some(PriceContext {
                        price: mark,
                        source: PriceSource::RestMark,
                    })
                }
                Ok(_) => {}
                Err(e) => debug!(symbol, error = %e, "REST mark price unavailable"),
            }

            match state.client.get_last_price(symbol).await {
                Ok(last) if last > 0.0 => {
                    return Some(PriceContext {
                        price: last,
                        source: PriceSource::RestLast,
                    })
                }
                Ok(_) => {}
                Err(e) => debug!(symbol, error = %e, "REST last price unavailable"),
            }
        }

        // 5. Cached (stale) tick.
        if let Some(stale) = cached {
            if stale.tick.last > 0.0 {
                return Some(PriceContext {
                    price: stale.tick.last,
                    source: PriceSource::CachedLast,
                });
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Journal helpers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn journal_signal(
    state: &Arc<EngineState>,
    symbol: &str,
    side: &str,
    price: f64,
    strength: f64,
    regime: Regime,
    filters_passed: &str,
    executed: bool,
    rejected_by: &str,
    linked_order_id: &str,
) {
    let record = SignalRecord {
        timestamp: Utc::now().to_rfc3339(),
        symbol: symbol.to_string(),
        side: side.to_string(),
        price,
        strength,
        regime: regime.to_string(),
        filters_passed: filters_passed.to_string(),
        executed,
        rejected_by: rejected_by.to_string(),
        linked_order_id: linked_order_id.to_string(),
    };
    if let Err(e) = state.journal.append_signal(&record) {
        state.push_error(format!("signal journal write failed: {e}"), None);
    }
}

#[allow(clippy::too_many_arguments)]
fn journal_order(
    state: &Arc<EngineState>,
    signal: &Signal,
    order_type: OrderType,
    size: f64,
    price: Option<f64>,
    status: &str,
    fill_price: f64,
    fill_size: f64,
    slippage: f64,
    fill_id: &str,
) {
    let record = OrderRecord {
        timestamp: Utc::now().to_rfc3339(),
        symbol: signal.symbol.clone(),
        side: signal.side.to_string(),
        order_type: order_type.as_okx().to_string(),
        size,
        price,
        status: status.to_string(),
        fill_price,
        fill_size,
        slippage,
        slippage_units: "usd".to_string(),
        time_in_force: TimeInForce::Gtc.to_string(),
        trigger_price: None,
        fill_id: fill_id.to_string(),
    };
    if let Err(e) = state.journal.append_order(&record) {
        state.push_error(format!("order journal write failed: {e}"), None);
    }
}

fn effective_equity(state: &Arc<EngineState>) -> f64 {
    let equity = state.equity();
    if equity > 0.0 {
        equity
    } else {
        FALLBACK_EQUITY_USD
    }
}

fn effective_free_margin(state: &Arc<EngineState>) -> f64 {
    let margin = state.free_margin();
    if margin > 0.0 {
        margin
    } else {
        FALLBACK_EQUITY_USD
    }
}
