// =============================================================================
// Regime Classifier — TRENDING / RANGING / CHOPPY with hysteresis
// =============================================================================
//
// Classification rules (evaluated top-to-bottom; first match wins):
//
//   1. CHOPPY   — volatility_percent > high_volatility_percent
//                 AND reversal_count > choppy_reversal_count
//                 AND volume_ratio > choppy_volume_ratio
//   2. TRENDING — ADX >= trending_adx AND +DI/-DI agree on a direction
//   3. RANGING  — ADX < ranging_adx
//   4. otherwise: hold the prior regime (hysteresis)
//
// A switch additionally requires `required_confirmations` consecutive
// identical raw labels AND `min_regime_duration_secs` since the previous
// switch. On switch the caller must reset the indicator engine for the
// symbol so regime-conditioned smoothing does not accumulate drift.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::indicators::IndicatorSnapshot;
use crate::regime::Regime;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// ADX at or above which the market counts as trending.
    pub trending_adx: f64,
    /// ADX below which the market counts as ranging.
    pub ranging_adx: f64,
    /// Volatility percent above which chop becomes possible.
    pub high_volatility_percent: f64,
    /// Reversal flips (within the indicator window) that must be exceeded.
    pub choppy_reversal_count: usize,
    /// Volume ratio that must be exceeded for chop.
    pub choppy_volume_ratio: f64,
    /// Consecutive identical raw labels required before a switch.
    pub required_confirmations: u32,
    /// Minimum seconds between switches.
    pub min_regime_duration_secs: u64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            trending_adx: 25.0,
            ranging_adx: 20.0,
            high_volatility_percent: 2.5,
            choppy_reversal_count: 4,
            choppy_volume_ratio: 1.5,
            required_confirmations: 3,
            min_regime_duration_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Published regime state: label, confidence, the reason text, and the
/// snapshot the classification was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub confidence: f64,
    pub reason: String,
    pub snapshot: IndicatorSnapshot,
    /// Timestamp (ms) at which this regime became active.
    pub active_since_ms: i64,
}

/// Outcome of one classification pass.
#[derive(Debug, Clone)]
pub struct RegimeUpdate {
    pub reading: RegimeReading,
    /// True when this pass switched to a new regime. The caller must reset
    /// indicator state for the symbol when set.
    pub switched: bool,
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

struct SymbolState {
    current: RegimeReading,
    candidate: Option<Regime>,
    candidate_count: u32,
    last_switch_ms: i64,
}

/// Per-symbol regime state machine. Thread-safe; intended to be shared via
/// `Arc`.
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
    state: RwLock<HashMap<String, SymbolState>>,
}

impl RegimeClassifier {
    pub fn new(thresholds: RegimeThresholds) -> Self {
        Self {
            thresholds,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Classify `snapshot` for `symbol` at `now_ms` and apply hysteresis.
    ///
    /// The first observation for a symbol adopts the raw label immediately;
    /// after that, switches go through confirmation counting and the
    /// minimum-duration gate.
    pub fn observe(
        &self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        now_ms: i64,
    ) -> RegimeUpdate {
        let raw = classify_raw(&self.thresholds, snapshot);

        let mut map = self.state.write();
        match map.get_mut(symbol) {
            None => {
                // No prior regime: adopt immediately (default RANGING when
                // no rule fires).
                let (regime, confidence, reason) = raw.unwrap_or((
                    Regime::Ranging,
                    0.30,
                    "no rule matched; defaulting to ranging".to_string(),
                ));
                let reading = RegimeReading {
                    regime,
                    confidence,
                    reason,
                    snapshot: snapshot.clone(),
                    active_since_ms: now_ms,
                };
                info!(symbol, regime = %regime, "initial regime adopted");
                map.insert(
                    symbol.to_string(),
                    SymbolState {
                        current: reading.clone(),
                        candidate: None,
                        candidate_count: 0,
                        last_switch_ms: now_ms,
                    },
                );
                RegimeUpdate {
                    reading,
                    switched: true,
                }
            }
            Some(state) => {
                let (label, confidence, reason) = match raw {
                    Some(r) => r,
                    None => {
                        // Hysteresis: hold the prior regime, refresh snapshot.
                        state.current.snapshot = snapshot.clone();
                        state.candidate = None;
                        state.candidate_count = 0;
                        return RegimeUpdate {
                            reading: state.current.clone(),
                            switched: false,
                        };
                    }
                };

                if label == state.current.regime {
                    // Same regime: refresh confidence/reason, clear candidate.
                    state.current.confidence = confidence;
                    state.current.reason = reason;
                    state.current.snapshot = snapshot.clone();
                    state.candidate = None;
                    state.candidate_count = 0;
                    return RegimeUpdate {
                        reading: state.current.clone(),
                        switched: false,
                    };
                }

                // Different label: count confirmations.
                if state.candidate == Some(label) {
                    state.candidate_count += 1;
                } else {
                    state.candidate = Some(label);
                    state.candidate_count = 1;
                }

                let elapsed_secs = ((now_ms - state.last_switch_ms) / 1000).max(0) as u64;
                let confirmed = state.candidate_count >= self.thresholds.required_confirmations;
                let aged = elapsed_secs >= self.thresholds.min_regime_duration_secs;

                if confirmed && aged {
                    info!(
                        symbol,
                        from = %state.current.regime,
                        to = %label,
                        confidence = format!("{:.2}", confidence),
                        reason = %reason,
                        "regime switched"
                    );
                    state.current = RegimeReading {
                        regime: label,
                        confidence,
                        reason,
                        snapshot: snapshot.clone(),
                        active_since_ms: now_ms,
                    };
                    state.candidate = None;
                    state.candidate_count = 0;
                    state.last_switch_ms = now_ms;
                    RegimeUpdate {
                        reading: state.current.clone(),
                        switched: true,
                    }
                } else {
                    debug!(
                        symbol,
                        candidate = %label,
                        count = state.candidate_count,
                        needed = self.thresholds.required_confirmations,
                        elapsed_secs,
                        "regime switch pending confirmation"
                    );
                    state.current.snapshot = snapshot.clone();
                    RegimeUpdate {
                        reading: state.current.clone(),
                        switched: false,
                    }
                }
            }
        }
    }

    /// Latest reading for `symbol`, if any observation has happened.
    pub fn current(&self, symbol: &str) -> Option<RegimeReading> {
        self.state.read().get(symbol).map(|s| s.current.clone())
    }
}

impl std::fmt::Debug for RegimeClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeClassifier")
            .field("symbols", &self.state.read().len())
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Raw classification
// ---------------------------------------------------------------------------

/// Apply the ordered rules. `None` means no rule fired — hold the prior
/// regime. Classification is idempotent: the same snapshot always yields
/// the same label.
fn classify_raw(
    thresholds: &RegimeThresholds,
    snap: &IndicatorSnapshot,
) -> Option<(Regime, f64, String)> {
    // 1. CHOPPY — volatility spike with fast reversals on elevated volume.
    if snap.volatility_percent > thresholds.high_volatility_percent
        && snap.reversal_count > thresholds.choppy_reversal_count
        && snap.volume_ratio > thresholds.choppy_volume_ratio
    {
        let confidence = remap(
            snap.volatility_percent,
            thresholds.high_volatility_percent,
            thresholds.high_volatility_percent * 2.0,
            0.60,
            1.0,
        );
        return Some((
            Regime::Choppy,
            confidence,
            format!(
                "volatility {:.2}% with {} reversals on {:.1}x volume",
                snap.volatility_percent, snap.reversal_count, snap.volume_ratio
            ),
        ));
    }

    // 2. TRENDING — strong ADX with DI agreement.
    if snap.adx >= thresholds.trending_adx {
        let direction = if snap.plus_di > snap.minus_di {
            Some("up")
        } else if snap.minus_di > snap.plus_di {
            Some("down")
        } else {
            None
        };
        if let Some(dir) = direction {
            let confidence = remap(snap.adx, thresholds.trending_adx, 50.0, 0.60, 1.0);
            return Some((
                Regime::Trending,
                confidence,
                format!(
                    "ADX {:.1} with {dir} directional agreement (+DI {:.1} / -DI {:.1})",
                    snap.adx, snap.plus_di, snap.minus_di
                ),
            ));
        }
    }

    // 3. RANGING — weak ADX.
    if snap.adx < thresholds.ranging_adx {
        let confidence = remap(snap.adx, thresholds.ranging_adx, 5.0, 0.50, 1.0);
        return Some((
            Regime::Ranging,
            confidence,
            format!("ADX {:.1} below ranging threshold", snap.adx),
        ));
    }

    None
}

/// Linearly remap `value` from [in_lo, in_hi] onto [out_lo, out_hi],
/// clamped. Works with inverted input ranges.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}
