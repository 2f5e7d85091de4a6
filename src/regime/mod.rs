// =============================================================================
// Regime Module
// =============================================================================
//
// Classifies each symbol's market state into TRENDING / RANGING / CHOPPY
// from the indicator snapshot, with hysteresis so the label cannot
// oscillate bar-to-bar.

pub mod classifier;

use serde::{Deserialize, Serialize};

pub use classifier::{RegimeClassifier, RegimeReading, RegimeThresholds};

/// Market-state label driving parameter overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Choppy,
}

impl Regime {
    /// Lower-case config key ("trending" / "ranging" / "choppy").
    pub fn key(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Choppy => "choppy",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Choppy => write!(f, "CHOPPY"),
        }
    }
}
