// =============================================================================
// Market Data Module
// =============================================================================
//
// Canonical live market state for the engine:
// - `MarketDataRegistry` — the sole read path for ticks, bars, book tops and
//   funding rates consumed by every downstream component.
// - OKX WebSocket ingest tasks that feed the registry.

pub mod registry;
pub mod stream;

use serde::{Deserialize, Serialize};

pub use registry::{FreshTick, MarketDataRegistry};

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Bar timeframes the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    /// All timeframes, in ascending order.
    pub const ALL: [Timeframe; 4] = [Self::M1, Self::M5, Self::M15, Self::H1];

    /// OKX candle channel suffix ("1m", "5m", "15m", "1H").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1H",
        }
    }

    /// Bar duration in seconds.
    pub fn secs(self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3600,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "1H" | "1h" => Some(Self::H1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single price update. Bid/ask may be absent on some updates; callers
/// must treat `None` as "unknown", never as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange timestamp in milliseconds.
    pub ts_ms: i64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: f64,
    /// Mark price; falls back to `last` when the venue omits it.
    pub mark: f64,
}

impl Tick {
    /// Mid price when both sides of the book are known.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some((b + a) / 2.0),
            _ => None,
        }
    }
}

/// A closed OHLCV bar. Bars are append-only per (symbol, timeframe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open timestamp (ms).
    pub open_time: i64,
    /// Bar close timestamp (ms).
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Composite key identifying a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe.as_str())
    }
}

/// Aggregated top-of-book view for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTop {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Quantity resting at the best bid.
    pub bid_size: f64,
    /// Quantity resting at the best ask.
    pub ask_size: f64,
    /// Summed bid quantity across the subscribed levels.
    pub bid_depth: f64,
    /// Summed ask quantity across the subscribed levels.
    pub ask_depth: f64,
    pub spread_bps: f64,
    /// Signed depth imbalance: (bid - ask) / (bid + ask), in [-1, +1].
    pub imbalance: f64,
    pub ts_ms: i64,
}

/// Latest funding-rate reading for a perpetual swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub symbol: String,
    /// Raw rate as a decimal (0.0001 = 0.01%).
    pub rate: f64,
    pub next_funding_time_ms: i64,
    pub ts_ms: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
        assert_eq!(Timeframe::parse("4h"), None);
    }

    #[test]
    fn timeframe_secs_ascending() {
        let secs: Vec<u64> = Timeframe::ALL.iter().map(|t| t.secs()).collect();
        assert!(secs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tick_mid_requires_both_sides() {
        let t = Tick {
            ts_ms: 0,
            bid: Some(99.0),
            ask: Some(101.0),
            last: 100.0,
            mark: 100.0,
        };
        assert_eq!(t.mid(), Some(100.0));

        let no_bid = Tick { bid: None, ..t.clone() };
        assert_eq!(no_bid.mid(), None);

        let zero_ask = Tick {
            ask: Some(0.0),
            ..t
        };
        assert_eq!(zero_ask.mid(), None);
    }

    #[test]
    fn bar_key_display() {
        let key = BarKey::new("BTC-USDT-SWAP", Timeframe::M5);
        assert_eq!(key.to_string(), "BTC-USDT-SWAP@5m");
    }
}
