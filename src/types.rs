// =============================================================================
// Shared types used across the Meridian perp engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a signal or position on a perpetual swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Used when signing PnL arithmetic.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn is_long(self) -> bool {
        self == Self::Long
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Why a position (or a fraction of one) was closed.
///
/// `PartialTpRemainder` tags the fractional close that leaves a remainder
/// running; the remainder later closes with its own reason (tp, sl, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Tp,
    Sl,
    Trailing,
    PartialTpRemainder,
    ProfitHarvest,
    ProfitDrawdown,
    MaxHolding,
    Manual,
    CircuitBreaker,
    ReconciliationClose,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tp => "tp",
            Self::Sl => "sl",
            Self::Trailing => "trailing",
            Self::PartialTpRemainder => "partial_tp_remainder",
            Self::ProfitHarvest => "profit_harvest",
            Self::ProfitDrawdown => "profit_drawdown",
            Self::MaxHolding => "max_holding",
            Self::Manual => "manual",
            Self::CircuitBreaker => "circuit_breaker",
            Self::ReconciliationClose => "reconciliation_close",
        };
        write!(f, "{s}")
    }
}

/// Venue-reported contract specification for one perpetual instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    /// Base units per contract (ctVal).
    pub contract_value: f64,
    /// Order size granularity in contracts.
    pub lot_size: f64,
    pub tick_size: f64,
    /// Minimum order size in contracts.
    pub min_size: f64,
    pub max_leverage: u32,
    /// Discrete leverage values the venue accepts, ascending.
    pub leverage_steps: Vec<u32>,
}

impl InstrumentSpec {
    /// Notional USD value of `contracts` at `price`.
    pub fn contracts_to_usd(&self, contracts: f64, price: f64) -> f64 {
        contracts * self.contract_value * price
    }

    /// Contracts purchasable with `usd` at `price`, rounded DOWN to lot
    /// size. Zero when the instrument is degenerate.
    pub fn usd_to_contracts(&self, usd: f64, price: f64) -> f64 {
        if price <= 0.0 || self.contract_value <= 0.0 || self.lot_size <= 0.0 {
            return 0.0;
        }
        let raw = usd / (self.contract_value * price);
        (raw / self.lot_size).floor() * self.lot_size
    }
}

/// Closed-position record. Exactly one is emitted per closing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Contracts closed by this event (a partial close reports the fraction).
    pub size_contracts: f64,
    pub gross_pnl: f64,
    pub commission: f64,
    pub funding_fee: f64,
    pub net_pnl: f64,
    pub duration_seconds: i64,
    pub exit_reason: ExitReason,
    pub regime_at_entry: String,
    /// ISO 8601 timestamp of the close.
    pub closed_at: String,
}

impl TradeResult {
    /// `net = gross - commission - funding`; commission and funding are
    /// positive costs in this convention.
    pub fn net_from_parts(gross: f64, commission: f64, funding_fee: f64) -> f64 {
        gross - commission - funding_fee
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_signs() {
        assert!((Side::Long.direction() - 1.0).abs() < f64::EPSILON);
        assert!((Side::Short.direction() + 1.0).abs() < f64::EPSILON);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn exit_reason_display_matches_journal_tags() {
        assert_eq!(ExitReason::Tp.to_string(), "tp");
        assert_eq!(ExitReason::ProfitDrawdown.to_string(), "profit_drawdown");
        assert_eq!(
            ExitReason::ReconciliationClose.to_string(),
            "reconciliation_close"
        );
        assert_eq!(
            ExitReason::PartialTpRemainder.to_string(),
            "partial_tp_remainder"
        );
    }

    #[test]
    fn exit_reason_serde_snake_case() {
        let json = serde_json::to_string(&ExitReason::MaxHolding).unwrap();
        assert_eq!(json, "\"max_holding\"");
        let back: ExitReason = serde_json::from_str("\"circuit_breaker\"").unwrap();
        assert_eq!(back, ExitReason::CircuitBreaker);
    }

    #[test]
    fn net_pnl_convention() {
        let net = TradeResult::net_from_parts(10.0, 0.5, 0.2);
        assert!((net - 9.3).abs() < 1e-12);
    }

    #[test]
    fn default_modes_are_safe() {
        assert_eq!(TradingMode::default(), TradingMode::Paused);
        assert_eq!(AccountMode::default(), AccountMode::Demo);
    }

    fn spec() -> InstrumentSpec {
        InstrumentSpec {
            symbol: "BTC-USDT-SWAP".into(),
            contract_value: 0.01,
            lot_size: 1.0,
            tick_size: 0.1,
            min_size: 1.0,
            max_leverage: 125,
            leverage_steps: vec![1, 2, 3, 5, 10, 20, 50, 75, 100, 125],
        }
    }

    #[test]
    fn size_conversion_round_trip_on_lot_multiples() {
        let s = spec();
        let price = 37_000.0;
        for n in [1.0, 2.0, 7.0, 100.0] {
            let usd = s.contracts_to_usd(n, price);
            assert!((s.usd_to_contracts(usd, price) - n).abs() < 1e-9);
        }
    }

    #[test]
    fn usd_to_contracts_rounds_down() {
        let s = spec();
        let price = 37_000.0;
        // 1.9 contracts' worth of USD still buys only 1 contract.
        let usd = s.contracts_to_usd(1.9, price);
        assert!((s.usd_to_contracts(usd, price) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_instrument_yields_zero() {
        let mut s = spec();
        s.contract_value = 0.0;
        assert_eq!(s.usd_to_contracts(1_000.0, 37_000.0), 0.0);
        assert_eq!(spec().usd_to_contracts(1_000.0, 0.0), 0.0);
    }
}
