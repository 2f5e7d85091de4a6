// =============================================================================
// Signals Module
// =============================================================================
//
// Typed directional signals and the regime-aware generator that scores them.
// A `Signal` is consumed the same tick it is emitted — nothing here is
// retained across cycles.

pub mod generator;

use serde::{Deserialize, Serialize};

use crate::regime::Regime;
use crate::types::Side;

pub use generator::{GeneratorOutput, SignalGenerator, SignalRejection};

/// The detector that dominated a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    RsiOversold,
    RsiOverbought,
    MacdCross,
    Impulse,
    MaAlign,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RsiOversold => "rsi_oversold",
            Self::RsiOverbought => "rsi_overbought",
            Self::MacdCross => "macd_cross",
            Self::Impulse => "impulse",
            Self::MaAlign => "ma_align",
        };
        write!(f, "{s}")
    }
}

/// A scored directional candidate that cleared the generator's gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub kind: SignalKind,
    /// Weighted score in [0, 12].
    pub score: f64,
    /// Normalised strength in [0, 1].
    pub strength: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub reference_price: f64,
    /// Filter names appended in application order by the filter pipeline.
    pub filters_passed: Vec<String>,
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_tags() {
        assert_eq!(SignalKind::RsiOversold.to_string(), "rsi_oversold");
        assert_eq!(SignalKind::MacdCross.to_string(), "macd_cross");
        assert_eq!(SignalKind::MaAlign.to_string(), "ma_align");
    }
}
