// =============================================================================
// Entry Executor — places opening orders and registers positions
// =============================================================================
//
// Responsibilities:
//   - Idempotency: a TTL-keyed fingerprint of {symbol, side, size, entry
//     bucket} refuses duplicate submissions inside the window. The
//     fingerprint applies ONLY to order submission — never to market data.
//   - Leverage is set on-exchange before the opening order.
//   - Limit order by default; on timeout the remainder is cancelled and,
//     when configured, escalated to market.
//   - Partial fills aggregate into a single logical position at the
//     volume-weighted average entry.
//   - Terminal rejects drop the signal; no position is registered.
//
// Demo mode simulates the fill locally and never touches the exchange.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::okx::{OkxClient, OrderType, RateLimitTracker, TimeInForce};
use crate::position::{Position, PositionRegistry};
use crate::regime::Regime;
use crate::signals::Signal;
use crate::sizing::SizedOrder;
use crate::types::{AccountMode, InstrumentSpec, Side};

/// Poll cadence while waiting on a resting limit order.
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Price bucket width for the idempotency fingerprint (10 bps).
const FINGERPRINT_BUCKET_FRACTION: f64 = 0.001;

/// Outcome of an execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Live order filled (fully or via market escalation) and the position
    /// is registered.
    Placed {
        position_id: String,
        order_id: String,
        fill_price: f64,
        fill_contracts: f64,
    },
    /// Demo fill simulated locally.
    Simulated { position_id: String },
    /// Same fingerprint seen inside the TTL — nothing sent.
    Duplicate { fingerprint: String },
    /// Order rested unfilled through the timeout and escalation was off.
    Expired { order_id: String },
    /// Rate budget or a pre-flight check refused the attempt.
    Blocked(String),
    /// The exchange rejected or transport failed terminally.
    Failed(EngineError),
}

impl ExecutionResult {
    pub fn position_id(&self) -> Option<&str> {
        match self {
            Self::Placed { position_id, .. } | Self::Simulated { position_id } => {
                Some(position_id)
            }
            _ => None,
        }
    }
}

pub struct EntryExecutor {
    client: Arc<OkxClient>,
    registry: Arc<PositionRegistry>,
    rate_limits: Arc<RateLimitTracker>,
    config: ExecutionConfig,
    /// fingerprint -> expiry timestamp (ms).
    fingerprints: Mutex<HashMap<String, i64>>,
}

impl EntryExecutor {
    pub fn new(
        client: Arc<OkxClient>,
        registry: Arc<PositionRegistry>,
        rate_limits: Arc<RateLimitTracker>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            client,
            registry,
            rate_limits,
            config,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Idempotency
    // -------------------------------------------------------------------------

    /// Build the entry fingerprint: symbol, side, exact size, and the entry
    /// price in logarithmic 10 bps buckets (nearby prices collide, distant
    /// ones do not).
    pub fn fingerprint(symbol: &str, side: Side, contracts: f64, entry_price: f64) -> String {
        let bucket = if entry_price > 0.0 {
            (entry_price.ln() / FINGERPRINT_BUCKET_FRACTION).round() as i64
        } else {
            0
        };
        format!("{symbol}|{side}|{contracts:.6}|{bucket}")
    }

    /// Returns `false` when the fingerprint was already seen inside the
    /// TTL. Fresh fingerprints are recorded with a new expiry.
    fn admit_fingerprint(&self, fingerprint: &str, now_ms: i64) -> bool {
        let ttl_ms = self.config.idempotency_ttl_secs as i64 * 1000;
        let mut map = self.fingerprints.lock();
        map.retain(|_, expiry| *expiry > now_ms);

        if map.contains_key(fingerprint) {
            return false;
        }
        map.insert(fingerprint.to_string(), now_ms + ttl_ms);
        true
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Execute an admitted, sized entry.
    pub async fn execute_entry(
        &self,
        signal: &Signal,
        order: &SizedOrder,
        instrument: &InstrumentSpec,
        regime: Regime,
        account_mode: AccountMode,
    ) -> ExecutionResult {
        let now_ms = Utc::now().timestamp_millis();
        let entry_price = signal.reference_price;

        let fingerprint =
            Self::fingerprint(&signal.symbol, signal.side, order.contracts, entry_price);
        if !self.admit_fingerprint(&fingerprint, now_ms) {
            warn!(
                symbol = %signal.symbol,
                fingerprint = %fingerprint,
                "duplicate entry suppressed by idempotency window"
            );
            return ExecutionResult::Duplicate { fingerprint };
        }

        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            contracts = order.contracts,
            leverage = order.leverage,
            entry_price,
            mode = %account_mode,
            "executing entry"
        );

        if account_mode == AccountMode::Demo {
            return self.execute_demo(signal, order, instrument, regime, entry_price, now_ms);
        }
        self.execute_live(signal, order, instrument, regime, entry_price, now_ms)
            .await
    }

    fn execute_demo(
        &self,
        signal: &Signal,
        order: &SizedOrder,
        instrument: &InstrumentSpec,
        regime: Regime,
        entry_price: f64,
        now_ms: i64,
    ) -> ExecutionResult {
        let position = Position::new(
            &signal.symbol,
            signal.side,
            entry_price,
            order.contracts,
            order.leverage,
            Some(order.margin_required),
            instrument.contract_value,
            regime,
            now_ms,
        );
        let position_id = self.registry.register(position);
        info!(
            position_id = %position_id,
            symbol = %signal.symbol,
            sim_order_id = %Uuid::new_v4(),
            "demo fill simulated"
        );
        ExecutionResult::Simulated { position_id }
    }

    async fn execute_live(
        &self,
        signal: &Signal,
        order: &SizedOrder,
        instrument: &InstrumentSpec,
        regime: Regime,
        entry_price: f64,
        now_ms: i64,
    ) -> ExecutionResult {
        if !self.rate_limits.try_acquire_order(now_ms) {
            return ExecutionResult::Blocked("order rate budget exhausted".to_string());
        }

        // Leverage is written before the order so the venue-side setting
        // matches what the sizer assumed.
        if let Err(e) = self.client.set_leverage(&signal.symbol, order.leverage).await {
            match e {
                EngineError::RejectTechnical { ref code, ref message } => {
                    // Usually a set-leverage race with an existing setting;
                    // not a trading loss, and frequently already correct.
                    warn!(
                        symbol = %signal.symbol,
                        code = %code,
                        detail = %message,
                        "set_leverage technical reject — continuing with entry"
                    );
                }
                other => {
                    warn!(symbol = %signal.symbol, error = %other, "set_leverage failed");
                    return ExecutionResult::Failed(other);
                }
            }
        }

        // Opening limit order at the signal's reference price.
        let client_order_id = format!("mrd{}", Uuid::new_v4().simple());
        let ack = match self
            .client
            .place_order(
                &signal.symbol,
                signal.side,
                OrderType::Limit,
                order.contracts,
                Some(entry_price),
                false,
                TimeInForce::Gtc,
                Some(&client_order_id),
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "opening order rejected");
                return ExecutionResult::Failed(e);
            }
        };

        // Poll for fills until the limit timeout.
        let mut fills: Vec<(f64, f64)> = Vec::new();
        let deadline = now_ms + self.config.limit_timeout_secs as i64 * 1000;
        let mut last_filled = 0.0;

        loop {
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
            match self.client.get_order(&signal.symbol, &ack.order_id).await {
                Ok(state) => {
                    if state.filled_contracts > last_filled {
                        fills.push((
                            state.avg_fill_price,
                            state.filled_contracts - last_filled,
                        ));
                        last_filled = state.filled_contracts;
                    }
                    if state.is_filled() {
                        break;
                    }
                    if !state.is_live() {
                        // Cancelled externally or rejected mid-flight.
                        break;
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(error = %e, "order poll transient failure — retrying");
                }
                Err(e) => {
                    warn!(error = %e, "order poll failed");
                    break;
                }
            }
            if Utc::now().timestamp_millis() >= deadline {
                break;
            }
        }

        let remaining = order.contracts - last_filled;
        if remaining > 0.0 {
            // Stop the resting remainder before deciding what happens next.
            if let Err(e) = self.client.cancel_order(&signal.symbol, &ack.order_id).await {
                debug!(error = %e, "cancel after timeout failed (order may be done)");
            }

            if self.config.escalate_to_market && remaining >= instrument.min_size {
                match self
                    .client
                    .place_order(
                        &signal.symbol,
                        signal.side,
                        OrderType::Market,
                        remaining,
                        None,
                        false,
                        TimeInForce::Ioc,
                        None,
                    )
                    .await
                {
                    Ok(market_ack) => {
                        // One settle-poll for the market fill price.
                        tokio::time::sleep(FILL_POLL_INTERVAL).await;
                        match self
                            .client
                            .get_order(&signal.symbol, &market_ack.order_id)
                            .await
                        {
                            Ok(state) if state.filled_contracts > 0.0 => {
                                fills.push((state.avg_fill_price, state.filled_contracts));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "market escalation fill poll failed");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "market escalation rejected");
                    }
                }
            }
        }

        let (vwap, total_filled) = aggregate_fills(&fills);
        if total_filled <= 0.0 {
            info!(
                symbol = %signal.symbol,
                order_id = %ack.order_id,
                "limit order expired unfilled — no position registered"
            );
            return ExecutionResult::Expired {
                order_id: ack.order_id,
            };
        }

        let position = Position::new(
            &signal.symbol,
            signal.side,
            vwap,
            total_filled,
            order.leverage,
            Some(order.margin_required * (total_filled / order.contracts)),
            instrument.contract_value,
            regime,
            now_ms,
        );
        let position_id = self.registry.register(position);

        info!(
            position_id = %position_id,
            symbol = %signal.symbol,
            order_id = %ack.order_id,
            fill_price = vwap,
            fill_contracts = total_filled,
            "live entry filled and position registered"
        );

        ExecutionResult::Placed {
            position_id,
            order_id: ack.order_id,
            fill_price: vwap,
            fill_contracts: total_filled,
        }
    }
}

/// Aggregate fill reports into (volume-weighted average price, total size).
fn aggregate_fills(fills: &[(f64, f64)]) -> (f64, f64) {
    let total: f64 = fills.iter().map(|(_, sz)| sz).sum();
    if total <= 0.0 {
        return (0.0, 0.0);
    }
    let weighted: f64 = fills.iter().map(|(px, sz)| px * sz).sum();
    (weighted / total, total)
}

impl std::fmt::Debug for EntryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryExecutor")
            .field("pending_fingerprints", &self.fingerprints.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalKind;

    fn executor() -> EntryExecutor {
        EntryExecutor::new(
            Arc::new(OkxClient::new("k", "s", "p", true, vec![1, 5, 10])),
            Arc::new(PositionRegistry::new()),
            Arc::new(RateLimitTracker::new()),
            ExecutionConfig::default(),
        )
    }

    fn signal() -> Signal {
        Signal {
            symbol: "BTC-USDT-SWAP".to_string(),
            side: Side::Long,
            kind: SignalKind::MacdCross,
            score: 8.0,
            strength: 0.7,
            confidence: 0.7,
            regime: Regime::Ranging,
            reference_price: 37_000.0,
            filters_passed: vec!["adx".into()],
            ts_ms: 0,
        }
    }

    fn sized() -> SizedOrder {
        SizedOrder {
            contracts: 3.0,
            notional_usd: 111.0,
            margin_required: 22.2,
            leverage: 5,
        }
    }

    fn instrument() -> InstrumentSpec {
        InstrumentSpec {
            symbol: "BTC-USDT-SWAP".into(),
            contract_value: 0.001,
            lot_size: 1.0,
            tick_size: 0.1,
            min_size: 1.0,
            max_leverage: 125,
            leverage_steps: vec![1, 5, 10],
        }
    }

    #[test]
    fn fingerprint_stable_within_bucket() {
        let a = EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 3.0, 37_000.0);
        let b = EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 3.0, 37_000.0);
        assert_eq!(a, b);
        // Different side or size is a different intent.
        assert_ne!(
            a,
            EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Short, 3.0, 37_000.0)
        );
        assert_ne!(
            a,
            EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 4.0, 37_000.0)
        );
        // Prices inside the 10 bps bucket collide; distant prices do not.
        assert_eq!(
            a,
            EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 3.0, 37_001.0)
        );
        assert_ne!(
            a,
            EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 3.0, 38_000.0)
        );
    }

    #[test]
    fn idempotency_ttl_blocks_then_expires() {
        let exec = executor();
        let fp = EntryExecutor::fingerprint("BTC-USDT-SWAP", Side::Long, 3.0, 37_000.0);

        assert!(exec.admit_fingerprint(&fp, 1_000));
        // Inside the 30s TTL: refused.
        assert!(!exec.admit_fingerprint(&fp, 10_000));
        // Past the TTL: admitted again.
        assert!(exec.admit_fingerprint(&fp, 1_000 + 31_000));
    }

    #[tokio::test]
    async fn demo_entry_registers_position() {
        let registry = Arc::new(PositionRegistry::new());
        let exec = EntryExecutor::new(
            Arc::new(OkxClient::new("k", "s", "p", true, vec![1, 5, 10])),
            registry.clone(),
            Arc::new(RateLimitTracker::new()),
            ExecutionConfig::default(),
        );

        let result = exec
            .execute_entry(
                &signal(),
                &sized(),
                &instrument(),
                Regime::Ranging,
                AccountMode::Demo,
            )
            .await;

        assert!(matches!(result, ExecutionResult::Simulated { .. }));
        let open = registry.open_for("BTC-USDT-SWAP");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].leverage, 5);
        assert!((open[0].margin_used - 22.2).abs() < 1e-9);
        assert!(!open[0].margin_estimated);
    }

    #[tokio::test]
    async fn duplicate_demo_entry_suppressed() {
        let exec = executor();
        let first = exec
            .execute_entry(
                &signal(),
                &sized(),
                &instrument(),
                Regime::Ranging,
                AccountMode::Demo,
            )
            .await;
        assert!(matches!(first, ExecutionResult::Simulated { .. }));

        let second = exec
            .execute_entry(
                &signal(),
                &sized(),
                &instrument(),
                Regime::Ranging,
                AccountMode::Demo,
            )
            .await;
        assert!(matches!(second, ExecutionResult::Duplicate { .. }));
    }

    #[test]
    fn vwap_aggregation() {
        let fills = [(100.0, 2.0), (101.0, 1.0), (99.5, 1.0)];
        let (vwap, total) = aggregate_fills(&fills);
        assert!((total - 4.0).abs() < 1e-12);
        assert!((vwap - (200.0 + 101.0 + 99.5) / 4.0).abs() < 1e-12);

        assert_eq!(aggregate_fills(&[]), (0.0, 0.0));
    }
}
