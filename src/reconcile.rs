// =============================================================================
// Reconciliation Worker — keep the local registry consistent with the venue
// =============================================================================
//
// Periodically diffs the local PositionRegistry against exchange-reported
// positions. The exchange is the source of truth on conflict:
//
//   - Local present, exchange absent: a Closing position finalizes to
//     Closed with its pending reason; anything else is drift and closes
//     locally with reason `reconciliation_close`.
//   - Local absent, exchange present: the position is adopted with minimal
//     metadata and runs through the normal exit pipeline from then on.
//   - Both present but diverging size/side: the exchange values overwrite
//     the local ones; the divergence is logged.
//
// Transport failures are retried with exponential backoff; on exhaustion
// the worker keeps local state untouched — positions are never deleted
// because the venue was unreachable.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::okx::{ExchangePosition, OkxClient};
use crate::position::{Position, PositionRegistry, PositionStatus};
use crate::regime::Regime;
use crate::types::{ExitReason, TradeResult};

/// Retry schedule for the positions fetch.
const MAX_FETCH_ATTEMPTS: u32 = 4;
const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Closing positions confirmed flat and finalized.
    pub finalized: usize,
    /// Non-closing local positions the exchange no longer has.
    pub drift_closed: usize,
    /// Exchange positions adopted into the registry.
    pub adopted: usize,
    /// Positions whose size/side were overwritten from the exchange.
    pub synced: usize,
    /// Trade results emitted by finalizations and drift closes.
    pub results: Vec<TradeResult>,
}

/// Apply the reconciliation rules to the registry given the venue's view.
///
/// `mark_price` supplies the best-known price per symbol for the TradeResult
/// of a finalized/drift-closed position (entry price when unknown).
/// `regime_for` tags adopted positions; adoption carries no synthetic entry
/// strategy beyond that.
pub fn reconcile_positions(
    registry: &PositionRegistry,
    exchange: &[ExchangePosition],
    mark_price: impl Fn(&str) -> Option<f64>,
    regime_for: impl Fn(&str) -> Regime,
    now_ms: i64,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    // ── Local -> exchange ───────────────────────────────────────────────
    for local in registry.all_open() {
        let venue = exchange
            .iter()
            .find(|e| e.symbol == local.symbol && e.contracts > 0.0);

        match venue {
            None => {
                let price = mark_price(&local.symbol).unwrap_or(local.entry_price);
                if local.status == PositionStatus::Closing {
                    let reason = local.pending_close_reason.unwrap_or(ExitReason::Manual);
                    if let Some(result) = registry.finalize_close(
                        &local.symbol,
                        &local.id,
                        price,
                        reason,
                        0.0,
                        0.0,
                        now_ms,
                    ) {
                        info!(
                            id = %local.id,
                            symbol = %local.symbol,
                            reason = %reason,
                            "closing position confirmed flat — finalized"
                        );
                        report.finalized += 1;
                        report.results.push(result);
                    }
                } else {
                    warn!(
                        id = %local.id,
                        symbol = %local.symbol,
                        "local position missing on exchange — drift close"
                    );
                    if let Some(result) = registry.finalize_close(
                        &local.symbol,
                        &local.id,
                        price,
                        ExitReason::ReconciliationClose,
                        0.0,
                        0.0,
                        now_ms,
                    ) {
                        report.drift_closed += 1;
                        report.results.push(result);
                    }
                }
            }
            Some(venue) => {
                if local.status == PositionStatus::Closing {
                    // The close never landed: the venue still holds the
                    // position. Reactivate so the exit pipeline retries.
                    warn!(
                        id = %local.id,
                        symbol = %local.symbol,
                        "closing position still open on exchange — reactivating for retry"
                    );
                    registry.with_position(&local.symbol, &local.id, |p| {
                        p.status = PositionStatus::Active;
                        p.pending_close_reason = None;
                    });
                }
                let size_diverges =
                    (venue.contracts - local.size_contracts).abs() > f64::EPSILON;
                let side_diverges = venue.side != local.side;
                if size_diverges || side_diverges {
                    warn!(
                        id = %local.id,
                        symbol = %local.symbol,
                        local_side = %local.side,
                        venue_side = %venue.side,
                        local_size = local.size_contracts,
                        venue_size = venue.contracts,
                        "position diverges — exchange wins"
                    );
                    registry.with_position(&local.symbol, &local.id, |p| {
                        p.side = venue.side;
                        p.size_contracts = venue.contracts;
                        if venue.leverage > 0 {
                            p.leverage = venue.leverage;
                        }
                        if let Some(margin) = venue.margin {
                            p.margin_used = margin;
                            p.margin_estimated = false;
                        }
                    });
                    report.synced += 1;
                }
            }
        }
    }

    // ── Exchange -> local (adoption) ────────────────────────────────────
    let tracked: Vec<String> = registry.symbols_with_positions();
    for venue in exchange {
        if venue.contracts <= 0.0 || tracked.contains(&venue.symbol) {
            continue;
        }
        info!(
            symbol = %venue.symbol,
            side = %venue.side,
            contracts = venue.contracts,
            avg_px = venue.avg_entry_price,
            "adopting exchange position into registry"
        );
        let mut position = Position::new(
            &venue.symbol,
            venue.side,
            venue.avg_entry_price,
            venue.contracts,
            venue.leverage.max(1),
            venue.margin,
            // ctVal is unknown at adoption; 1.0 keeps PnL proportional and
            // is corrected by the next divergence sync if wrong.
            1.0,
            regime_for(&venue.symbol),
            now_ms,
        );
        position.adopted = true;
        registry.register(position);
        report.adopted += 1;
    }

    debug!(
        finalized = report.finalized,
        drift_closed = report.drift_closed,
        adopted = report.adopted,
        synced = report.synced,
        "reconciliation pass complete"
    );

    report
}

/// Fetch exchange positions with bounded exponential backoff. `None` means
/// every attempt failed and local state must be kept as-is.
pub async fn fetch_positions_with_retry(client: &OkxClient) -> Option<Vec<ExchangePosition>> {
    let mut backoff_ms = BASE_BACKOFF_MS;
    for attempt in 1..=MAX_FETCH_ATTEMPTS {
        match client.get_positions().await {
            Ok(positions) => return Some(positions),
            Err(e) if e.is_retryable() => {
                let wait = match e {
                    EngineError::RateLimited {
                        retry_after_ms: Some(advised),
                    } => advised,
                    _ => backoff_ms,
                };
                warn!(
                    attempt,
                    wait_ms = wait,
                    error = %e,
                    "positions fetch failed — backing off"
                );
                tokio::time::sleep(Duration::from_millis(wait)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
            Err(e) => {
                warn!(error = %e, "positions fetch failed terminally");
                return None;
            }
        }
    }
    warn!("positions fetch retries exhausted — keeping local state");
    None
}

/// One reconciliation cycle against the live venue.
pub async fn run_cycle(
    client: &Arc<OkxClient>,
    registry: &Arc<PositionRegistry>,
    mark_price: impl Fn(&str) -> Option<f64>,
    regime_for: impl Fn(&str) -> Regime,
) -> Option<ReconcileReport> {
    let exchange = fetch_positions_with_retry(client.as_ref()).await?;
    let now_ms = Utc::now().timestamp_millis();
    Some(reconcile_positions(
        registry, &exchange, mark_price, regime_for, now_ms,
    ))
}
