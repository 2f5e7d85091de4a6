// =============================================================================
// Risk Governor — admission gate and circuit breakers
// =============================================================================
//
// Every prospective entry passes the ordered, short-circuiting checks:
//
//   1. Global kill switch (manual).
//   2. Daily loss halt — once daily PnL breaches the cap, no new entries
//      until the UTC day rolls over.
//   3. Concurrency cap — open positions at the balance-profile limit.
//   4. Per-pair cooldown — a symbol in its block window is rejected.
//
// Post-close hooks maintain the per-pair loss streak: consecutive losses
// arm `block_until`; a win resets the streak. Technical exchange errors are
// explicitly NOT trading losses and never touch the streak or the cooldown.
//
// Daily statistics reset automatically when the UTC date changes.
// =============================================================================

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why an entry was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskRefusal {
    Killed,
    DailyLossHalt,
    MaxOpenPositions,
    PairCooldown,
}

impl std::fmt::Display for RiskRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Killed => write!(f, "kill switch active"),
            Self::DailyLossHalt => write!(f, "daily loss cap reached"),
            Self::MaxOpenPositions => write!(f, "max open positions reached"),
            Self::PairCooldown => write!(f, "pair cooling down"),
        }
    }
}

/// Rolling per-pair counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairState {
    pub consecutive_losses: u32,
    /// Entries for this pair are blocked until this timestamp (ms).
    pub block_until_ms: Option<i64>,
}

/// Serialisable snapshot of the governor's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub daily_pnl: f64,
    pub daily_loss_triggered: bool,
    pub daily_trades: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub killed: bool,
    pub current_date: String,
    pub pairs: HashMap<String, PairState>,
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

struct Inner {
    daily_pnl: f64,
    daily_loss_triggered: bool,
    daily_trades: u32,
    daily_wins: u32,
    daily_losses: u32,
    killed: bool,
    current_date: String,
    pairs: HashMap<String, PairState>,
}

pub struct RiskGovernor {
    state: RwLock<Inner>,
    limits: RiskConfig,
}

impl RiskGovernor {
    pub fn new(limits: RiskConfig, now_ms: i64) -> Self {
        info!(
            max_daily_loss_percent = limits.max_daily_loss_percent,
            consecutive_losses_limit = limits.consecutive_losses_limit,
            pair_block_duration_min = limits.pair_block_duration_min,
            "risk governor initialised"
        );
        Self {
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                daily_loss_triggered: false,
                daily_trades: 0,
                daily_wins: 0,
                daily_losses: 0,
                killed: false,
                current_date: utc_date(now_ms),
                pairs: HashMap::new(),
            }),
            limits,
        }
    }

    // -------------------------------------------------------------------------
    // Entry admission
    // -------------------------------------------------------------------------

    /// Gate a prospective entry. Checks short-circuit in priority order.
    pub fn admit(
        &self,
        symbol: &str,
        equity_usd: f64,
        open_positions: u32,
        max_open_positions: u32,
        now_ms: i64,
    ) -> Result<(), RiskRefusal> {
        self.maybe_reset_daily(now_ms);
        let mut s = self.state.write();

        if s.killed {
            return Err(RiskRefusal::Killed);
        }

        // Daily loss cap; sticky until UTC rollover once triggered.
        let cap_usd = equity_usd * self.limits.max_daily_loss_percent / 100.0;
        if s.daily_loss_triggered || (cap_usd > 0.0 && -s.daily_pnl >= cap_usd) {
            if !s.daily_loss_triggered {
                s.daily_loss_triggered = true;
                warn!(
                    daily_pnl = s.daily_pnl,
                    cap_usd, "daily loss cap breached — halting new entries until UTC rollover"
                );
            }
            return Err(RiskRefusal::DailyLossHalt);
        }

        if open_positions >= max_open_positions {
            return Err(RiskRefusal::MaxOpenPositions);
        }

        if let Some(pair) = s.pairs.get(symbol) {
            if let Some(block_until) = pair.block_until_ms {
                if now_ms < block_until {
                    return Err(RiskRefusal::PairCooldown);
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Post-close hooks
    // -------------------------------------------------------------------------

    /// Record a closed trade's net PnL and update the pair streak. Arms the
    /// per-pair block when the streak reaches the limit.
    pub fn record_close(&self, symbol: &str, net_pnl: f64, now_ms: i64) {
        self.maybe_reset_daily(now_ms);
        let mut s = self.state.write();

        s.daily_pnl += net_pnl;
        s.daily_trades += 1;

        let limit = self.limits.consecutive_losses_limit;
        let block_ms = self.limits.pair_block_duration_min as i64 * 60_000;
        let pair = s.pairs.entry(symbol.to_string()).or_default();

        if net_pnl >= 0.0 {
            pair.consecutive_losses = 0;
        } else {
            pair.consecutive_losses += 1;
            if pair.consecutive_losses >= limit {
                pair.block_until_ms = Some(now_ms + block_ms);
                warn!(
                    symbol,
                    losses = pair.consecutive_losses,
                    block_minutes = self.limits.pair_block_duration_min,
                    "loss streak limit reached — pair cooldown armed"
                );
            }
        }

        if net_pnl >= 0.0 {
            s.daily_wins += 1;
        } else {
            s.daily_losses += 1;
        }
    }

    /// A technical exchange condition (leverage race, temporary reject) is
    /// not a trading loss: the streak and cooldown stay untouched.
    pub fn record_technical_error(&self, symbol: &str, detail: &str) {
        warn!(symbol, detail, "technical exchange error — not counted as a trading loss");
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    pub fn kill(&self) {
        self.state.write().killed = true;
        warn!("kill switch activated — all new entries halted");
    }

    pub fn revive(&self) {
        self.state.write().killed = false;
        info!("kill switch cleared");
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn snapshot(&self, now_ms: i64) -> RiskSnapshot {
        self.maybe_reset_daily(now_ms);
        let s = self.state.read();
        RiskSnapshot {
            daily_pnl: s.daily_pnl,
            daily_loss_triggered: s.daily_loss_triggered,
            daily_trades: s.daily_trades,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            killed: s.killed,
            current_date: s.current_date.clone(),
            pairs: s.pairs.clone(),
        }
    }

    /// Whether `symbol` is currently inside its cooldown window.
    pub fn is_cooling_down(&self, symbol: &str, now_ms: i64) -> bool {
        let s = self.state.read();
        s.pairs
            .get(symbol)
            .and_then(|p| p.block_until_ms)
            .map(|until| now_ms < until)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Daily rollover
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self, now_ms: i64) {
        let today = utc_date(now_ms);
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Re-check under the write lock; another thread may have reset.
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "UTC date rolled — resetting daily risk counters"
            );
            s.daily_pnl = 0.0;
            s.daily_loss_triggered = false;
            s.daily_trades = 0;
            s.daily_wins = 0;
            s.daily_losses = 0;
            s.current_date = today;
            // Pair streaks survive the rollover; expired blocks clear lazily.
        }
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskGovernor")
            .field("daily_pnl", &s.daily_pnl)
            .field("killed", &s.killed)
            .field("pairs", &s.pairs.len())
            .finish()
    }
}

fn utc_date(now_ms: i64) -> String {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "invalid-date".to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default(), 0)
    }

    #[test]
    fn admits_by_default() {
        let g = governor();
        assert!(g.admit("BTC-USDT-SWAP", 1_000.0, 0, 3, 1_000).is_ok());
    }

    #[test]
    fn kill_switch_blocks_everything() {
        let g = governor();
        g.kill();
        assert_eq!(
            g.admit("BTC-USDT-SWAP", 1_000.0, 0, 3, 1_000),
            Err(RiskRefusal::Killed)
        );
        g.revive();
        assert!(g.admit("BTC-USDT-SWAP", 1_000.0, 0, 3, 1_000).is_ok());
    }

    #[test]
    fn daily_loss_halts_until_rollover() {
        let g = governor();
        // Default cap 5% of 1000 = $50.
        g.record_close("BTC-USDT-SWAP", -60.0, 1_000);
        assert_eq!(
            g.admit("ETH-USDT-SWAP", 1_000.0, 0, 3, 2_000),
            Err(RiskRefusal::DailyLossHalt)
        );
        // Sticky for the rest of the day even without further losses.
        assert_eq!(
            g.admit("ETH-USDT-SWAP", 1_000.0, 0, 3, 3_000),
            Err(RiskRefusal::DailyLossHalt)
        );
        // Next UTC day: counters reset, entries flow again.
        assert!(g.admit("ETH-USDT-SWAP", 1_000.0, 0, 3, DAY_MS + 1_000).is_ok());
        assert!((g.snapshot(DAY_MS + 1_000).daily_pnl).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrency_cap_rejects() {
        let g = governor();
        assert_eq!(
            g.admit("BTC-USDT-SWAP", 1_000.0, 3, 3, 1_000),
            Err(RiskRefusal::MaxOpenPositions)
        );
        assert!(g.admit("BTC-USDT-SWAP", 1_000.0, 2, 3, 1_000).is_ok());
    }

    #[test]
    fn loss_streak_arms_pair_cooldown() {
        let g = governor();
        // Default limit is 3 consecutive losses.
        g.record_close("BTC-USDT-SWAP", -1.0, 1_000);
        g.record_close("BTC-USDT-SWAP", -1.0, 2_000);
        assert!(!g.is_cooling_down("BTC-USDT-SWAP", 3_000));
        g.record_close("BTC-USDT-SWAP", -1.0, 3_000);
        assert!(g.is_cooling_down("BTC-USDT-SWAP", 4_000));
        assert_eq!(
            g.admit("BTC-USDT-SWAP", 10_000.0, 0, 3, 4_000),
            Err(RiskRefusal::PairCooldown)
        );
        // Other pairs unaffected.
        assert!(g.admit("ETH-USDT-SWAP", 10_000.0, 0, 3, 4_000).is_ok());
        // Cooldown expires after pair_block_duration_min (30 min default).
        let after = 3_000 + 30 * 60_000 + 1;
        assert!(g.admit("BTC-USDT-SWAP", 10_000.0, 0, 3, after).is_ok());
    }

    #[test]
    fn win_resets_streak() {
        let g = governor();
        g.record_close("BTC-USDT-SWAP", -1.0, 1_000);
        g.record_close("BTC-USDT-SWAP", -1.0, 2_000);
        g.record_close("BTC-USDT-SWAP", 5.0, 3_000);
        g.record_close("BTC-USDT-SWAP", -1.0, 4_000);
        // Streak restarted at 1 — no cooldown.
        assert!(!g.is_cooling_down("BTC-USDT-SWAP", 5_000));
    }

    #[test]
    fn technical_errors_do_not_touch_streak() {
        let g = governor();
        g.record_close("BTC-USDT-SWAP", -1.0, 1_000);
        g.record_close("BTC-USDT-SWAP", -1.0, 2_000);
        // Two technical rejects in between must not complete the streak.
        g.record_technical_error("BTC-USDT-SWAP", "59000 leverage race");
        g.record_technical_error("BTC-USDT-SWAP", "50013 busy");
        assert!(!g.is_cooling_down("BTC-USDT-SWAP", 3_000));
        let snap = g.snapshot(3_000);
        assert_eq!(snap.pairs["BTC-USDT-SWAP"].consecutive_losses, 2);
        assert_eq!(snap.daily_trades, 2);
    }

    #[test]
    fn snapshot_counts_wins_losses() {
        let g = governor();
        g.record_close("A", 2.0, 1_000);
        g.record_close("B", -1.0, 2_000);
        let snap = g.snapshot(3_000);
        assert_eq!(snap.daily_wins, 1);
        assert_eq!(snap.daily_losses, 1);
        assert!((snap.daily_pnl - 1.0).abs() < 1e-12);
    }
}
