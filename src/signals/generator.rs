// =============================================================================
// Signal Generator — regime-conditioned detector scoring
// =============================================================================
//
// For each symbol with fresh indicators, both sides are scored out of 12:
//
//   EMA alignment 2, RSI zone 2, Bollinger extreme 2, volume confirmation 2,
//   MACD 2, SMA trend 1, detector-specific bonus 1.
//
// Regime rules:
//   - TRENDING: RSI mean-reversion candidates are blocked outright. Fading a
//     move while ADX confirms a trend is the counter-trend trade this engine
//     refuses to take.
//   - RANGING: counter-trend candidates (side against the DI direction) keep
//     trading but carry a penalty multiplier on strength and confidence.
//   - CHOPPY: the minimum score threshold is raised via the resolved
//     parameter set rather than blocking.
//
// Emission: score >= min_score_threshold AND strength >= min_signal_strength.
// When both sides pass, the higher score wins; equal scores are an explicit
// non-trade.
// =============================================================================

use tracing::debug;

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::params::ParameterSet;
use crate::regime::{Regime, RegimeReading};
use crate::signals::{Signal, SignalKind};
use crate::types::Side;

/// Maximum achievable score.
pub const MAX_SCORE: f64 = 12.0;

/// Strength/confidence multiplier for counter-trend candidates in RANGING.
const RANGING_COUNTER_TREND_PENALTY: f64 = 0.7;

/// Fraction of bar range the body must cover to count as an impulse bar.
const IMPULSE_BODY_FRACTION: f64 = 0.6;

/// RSI margin beyond the configured extreme that earns the detector bonus.
const RSI_BONUS_MARGIN: f64 = 5.0;

/// A candidate that was evaluated but not emitted, with the rejecting rule.
/// Journaled as `executed = false`.
#[derive(Debug, Clone)]
pub struct SignalRejection {
    pub side: Side,
    pub kind: SignalKind,
    pub score: f64,
    pub reason: String,
}

/// Outcome of one generator pass over a symbol.
#[derive(Debug, Clone, Default)]
pub struct GeneratorOutput {
    pub signal: Option<Signal>,
    pub rejections: Vec<SignalRejection>,
}

pub struct SignalGenerator;

impl SignalGenerator {
    /// Score both sides for `symbol` and emit at most one signal.
    pub fn evaluate(
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        last_bar: Option<&Bar>,
        regime: &RegimeReading,
        params: &ParameterSet,
        now_ms: i64,
    ) -> GeneratorOutput {
        let mut output = GeneratorOutput::default();

        let long = score_side(Side::Long, snapshot, last_bar, params);
        let short = score_side(Side::Short, snapshot, last_bar, params);

        let mut candidates: Vec<Candidate> = Vec::new();
        for candidate in [long, short].into_iter().flatten() {
            match apply_regime_rules(candidate, snapshot, regime.regime) {
                RuleResult::Pass(c) => candidates.push(c),
                RuleResult::Blocked(rejection) => output.rejections.push(rejection),
            }
        }

        // Gate on threshold and strength.
        let mut admitted: Vec<Candidate> = Vec::new();
        for c in candidates {
            let raw_strength = (c.score / MAX_SCORE).clamp(0.0, 1.0);
            let strength = raw_strength * c.penalty;
            let confidence =
                ((0.5 * raw_strength + 0.5 * regime.confidence) * c.penalty).clamp(0.0, 1.0);

            if c.score < params.min_score_threshold {
                output.rejections.push(SignalRejection {
                    side: c.side,
                    kind: c.kind,
                    score: c.score,
                    reason: format!(
                        "score {:.1} below threshold {:.1}",
                        c.score, params.min_score_threshold
                    ),
                });
                continue;
            }
            if strength < params.min_signal_strength {
                output.rejections.push(SignalRejection {
                    side: c.side,
                    kind: c.kind,
                    score: c.score,
                    reason: format!(
                        "strength {:.2} below minimum {:.2}",
                        strength, params.min_signal_strength
                    ),
                });
                continue;
            }
            admitted.push(Candidate {
                strength,
                confidence,
                ..c
            });
        }

        // Tie-break: higher score wins; equal scores are an explicit
        // non-trade.
        output.signal = match admitted.len() {
            0 => None,
            1 => Some(admitted.remove(0).into_signal(symbol, snapshot, regime.regime, now_ms)),
            _ => {
                let a = &admitted[0];
                let b = &admitted[1];
                if (a.score - b.score).abs() < f64::EPSILON {
                    debug!(
                        symbol,
                        score = a.score,
                        "both sides scored equally — skipping"
                    );
                    output.rejections.push(SignalRejection {
                        side: a.side,
                        kind: a.kind,
                        score: a.score,
                        reason: "long and short scored equally".to_string(),
                    });
                    None
                } else {
                    let winner = if a.score > b.score { 0 } else { 1 };
                    Some(admitted.remove(winner).into_signal(
                        symbol,
                        snapshot,
                        regime.regime,
                        now_ms,
                    ))
                }
            }
        };

        if let Some(ref s) = output.signal {
            debug!(
                symbol,
                side = %s.side,
                kind = %s.kind,
                score = s.score,
                strength = format!("{:.2}", s.strength),
                regime = %s.regime,
                "signal emitted"
            );
        }

        output
    }
}

// ---------------------------------------------------------------------------
// Candidate scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    side: Side,
    kind: SignalKind,
    score: f64,
    /// 1.0 normally; the ranging counter-trend penalty when applied.
    penalty: f64,
    strength: f64,
    confidence: f64,
    rsi_driven: bool,
}

impl Candidate {
    fn into_signal(
        self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        regime: Regime,
        ts_ms: i64,
    ) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            side: self.side,
            kind: self.kind,
            score: self.score,
            strength: self.strength,
            confidence: self.confidence,
            regime,
            reference_price: snapshot.last_price,
            filters_passed: Vec::new(),
            ts_ms,
        }
    }
}

/// Score one side. Returns `None` when no detector fired for that side.
fn score_side(
    side: Side,
    snap: &IndicatorSnapshot,
    last_bar: Option<&Bar>,
    params: &ParameterSet,
) -> Option<Candidate> {
    let is_long = side.is_long();
    let price = snap.last_price;

    let ema_aligned = if is_long {
        snap.ema_fast > snap.ema_slow && price > snap.ema_fast
    } else {
        snap.ema_fast < snap.ema_slow && price < snap.ema_fast
    };

    let rsi_zone = if is_long {
        snap.rsi <= params.rsi_oversold
    } else {
        snap.rsi >= params.rsi_overbought
    };

    let bb_extreme = if is_long {
        price <= snap.bb_lower
    } else {
        price >= snap.bb_upper
    };

    let volume_confirms = snap.volume_ratio >= 1.2;

    let macd_crossed = if is_long {
        snap.macd_crossed_up
    } else {
        snap.macd_crossed_down
    };
    let macd_favours = if is_long {
        macd_crossed || snap.macd_histogram > 0.0
    } else {
        macd_crossed || snap.macd_histogram < 0.0
    };

    let sma_trend = if is_long {
        price > snap.sma
    } else {
        price < snap.sma
    };

    let impulse = impulse_bar(side, last_bar) && ema_aligned;

    // At least one detector must fire to produce a candidate at all.
    if !(rsi_zone || macd_crossed || impulse || ema_aligned) {
        return None;
    }

    let mut score = 0.0;
    if ema_aligned {
        score += 2.0;
    }
    if rsi_zone {
        score += 2.0;
    }
    if bb_extreme {
        score += 2.0;
    }
    if volume_confirms {
        score += 2.0;
    }
    if macd_favours {
        score += 2.0;
    }
    if sma_trend {
        score += 1.0;
    }

    // Detector-specific bonus (the reserved 12th point).
    let deep_rsi = if is_long {
        snap.rsi <= params.rsi_oversold - RSI_BONUS_MARGIN
    } else {
        snap.rsi >= params.rsi_overbought + RSI_BONUS_MARGIN
    };
    if deep_rsi || macd_crossed || impulse {
        score += 1.0;
    }

    let kind = if rsi_zone {
        if is_long {
            SignalKind::RsiOversold
        } else {
            SignalKind::RsiOverbought
        }
    } else if macd_crossed {
        SignalKind::MacdCross
    } else if impulse {
        SignalKind::Impulse
    } else {
        SignalKind::MaAlign
    };

    Some(Candidate {
        side,
        kind,
        score,
        penalty: 1.0,
        strength: 0.0,
        confidence: 0.0,
        rsi_driven: rsi_zone,
    })
}

/// A directional bar whose body covers most of its range.
fn impulse_bar(side: Side, bar: Option<&Bar>) -> bool {
    let Some(bar) = bar else {
        return false;
    };
    let range = bar.high - bar.low;
    if range <= 0.0 {
        return false;
    }
    let body = bar.close - bar.open;
    let directional = if side.is_long() { body > 0.0 } else { body < 0.0 };
    directional && body.abs() / range >= IMPULSE_BODY_FRACTION
}

// ---------------------------------------------------------------------------
// Regime rules
// ---------------------------------------------------------------------------

enum RuleResult {
    Pass(Candidate),
    Blocked(SignalRejection),
}

fn apply_regime_rules(
    mut candidate: Candidate,
    snap: &IndicatorSnapshot,
    regime: Regime,
) -> RuleResult {
    match regime {
        Regime::Trending => {
            // RSI mean-reversion fades the move a confirmed trend is making;
            // blocked outright regardless of which side it lands on.
            if candidate.rsi_driven {
                return RuleResult::Blocked(SignalRejection {
                    side: candidate.side,
                    kind: candidate.kind,
                    score: candidate.score,
                    reason: "counter-trend RSI signal blocked in trending regime".to_string(),
                });
            }
            // Non-RSI candidates against the DI direction are also blocked.
            let di_dir = if snap.plus_di > snap.minus_di {
                Some(Side::Long)
            } else if snap.minus_di > snap.plus_di {
                Some(Side::Short)
            } else {
                None
            };
            if let Some(trend_side) = di_dir {
                if candidate.side != trend_side {
                    return RuleResult::Blocked(SignalRejection {
                        side: candidate.side,
                        kind: candidate.kind,
                        score: candidate.score,
                        reason: format!(
                            "{} candidate against {} trend blocked",
                            candidate.side, trend_side
                        ),
                    });
                }
            }
            RuleResult::Pass(candidate)
        }
        Regime::Ranging => {
            let counter_trend = if snap.plus_di > snap.minus_di {
                candidate.side == Side::Short
            } else if snap.minus_di > snap.plus_di {
                candidate.side == Side::Long
            } else {
                false
            };
            if counter_trend {
                candidate.penalty = RANGING_COUNTER_TREND_PENALTY;
            }
            RuleResult::Pass(candidate)
        }
        // CHOPPY raises min_score_threshold through the parameter resolver;
        // nothing is blocked here.
        Regime::Choppy => RuleResult::Pass(candidate),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::indicators::TrendDirection;
    use crate::params::ParameterResolver;
    use std::sync::Arc;

    fn base_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 50.0,
            ema_fast: 100.0,
            ema_slow: 100.0,
            atr: 1.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            macd_crossed_up: false,
            macd_crossed_down: false,
            adx: 18.0,
            plus_di: 20.0,
            minus_di: 20.0,
            volatility_percent: 1.0,
            trend_direction: TrendDirection::Neutral,
            bb_upper: 102.0,
            bb_lower: 98.0,
            bb_width_percent: 4.0,
            sma: 100.0,
            volume_ratio: 1.0,
            reversal_count: 1,
            last_price: 100.0,
        }
    }

    fn reading(regime: Regime, snap: &IndicatorSnapshot) -> RegimeReading {
        RegimeReading {
            regime,
            confidence: 0.8,
            reason: "test".to_string(),
            snapshot: snap.clone(),
            active_since_ms: 0,
        }
    }

    fn params(regime: Regime) -> Arc<ParameterSet> {
        ParameterResolver::new(EngineConfig::default()).resolve("BTC-USDT-SWAP", regime, 5_000.0)
    }

    fn strong_long_snapshot() -> IndicatorSnapshot {
        let mut s = base_snapshot();
        // Deep oversold at the lower band with bullish cross and volume.
        s.rsi = 22.0;
        s.last_price = 97.5;
        s.ema_fast = 98.0;
        s.ema_slow = 99.0;
        s.bb_lower = 98.0;
        s.bb_upper = 103.0;
        s.sma = 99.0;
        s.volume_ratio = 1.5;
        s.macd_crossed_up = true;
        s.macd_histogram = 0.2;
        s
    }

    #[test]
    fn strong_oversold_emits_long_in_ranging() {
        let snap = strong_long_snapshot();
        let p = params(Regime::Ranging);
        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Ranging, &snap),
            &p,
            1_000,
        );
        let signal = out.signal.expect("expected a long signal");
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.kind, SignalKind::RsiOversold);
        assert!(signal.score >= p.min_score_threshold);
        assert!(signal.strength > 0.0 && signal.strength <= 1.0);
        assert!(signal.filters_passed.is_empty());
    }

    #[test]
    fn trending_blocks_counter_trend_rsi() {
        // Literal scenario: TRENDING with +DI > -DI, RSI = 22 for BTC.
        let mut snap = strong_long_snapshot();
        snap.adx = 32.0;
        snap.plus_di = 28.0;
        snap.minus_di = 12.0;

        let p = params(Regime::Trending);
        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Trending, &snap),
            &p,
            1_000,
        );
        assert!(out.signal.is_none(), "no long entry may be produced");
        assert!(
            out.rejections.iter().any(|r| {
                r.side == Side::Long && r.reason.contains("counter-trend RSI")
            }),
            "rejection must carry the blocking rule: {:?}",
            out.rejections
        );
    }

    #[test]
    fn trending_blocks_rsi_overbought_short_too() {
        let mut snap = base_snapshot();
        snap.rsi = 78.0;
        snap.adx = 30.0;
        snap.plus_di = 28.0;
        snap.minus_di = 12.0;
        snap.last_price = 103.5;
        snap.bb_upper = 103.0;
        snap.macd_histogram = -0.1;
        snap.volume_ratio = 1.5;

        let p = params(Regime::Trending);
        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Trending, &snap),
            &p,
            1_000,
        );
        assert!(out.signal.is_none());
        assert!(!out.rejections.is_empty());
    }

    #[test]
    fn ranging_penalises_counter_trend_instead_of_blocking() {
        // DI points up; a short candidate keeps trading with reduced
        // strength.
        let mut snap = base_snapshot();
        snap.rsi = 75.0;
        snap.plus_di = 25.0;
        snap.minus_di = 15.0;
        snap.adx = 15.0;
        snap.last_price = 102.5;
        snap.bb_upper = 102.0;
        snap.ema_fast = 103.0;
        snap.ema_slow = 104.0;
        snap.sma = 103.0;
        snap.macd_histogram = -0.2;
        snap.macd_crossed_down = true;
        snap.volume_ratio = 1.5;

        let p = params(Regime::Ranging);
        let out = SignalGenerator::evaluate(
            "ETH-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Ranging, &snap),
            &p,
            1_000,
        );
        if let Some(signal) = out.signal {
            assert_eq!(signal.side, Side::Short);
            // Penalised strength: raw would be score/12; penalty shrinks it.
            let raw = signal.score / MAX_SCORE;
            assert!(
                signal.strength < raw,
                "penalty must reduce strength: {} vs raw {}",
                signal.strength,
                raw
            );
        } else {
            // Acceptable alternative: the penalty pushed strength below the
            // minimum and the rejection says so.
            assert!(out
                .rejections
                .iter()
                .any(|r| r.reason.contains("strength")));
        }
    }

    #[test]
    fn weak_score_rejected_with_reason() {
        let mut snap = base_snapshot();
        // Only EMA alignment fires; score stays below the threshold.
        snap.ema_fast = 101.0;
        snap.ema_slow = 100.0;
        snap.last_price = 102.0;
        snap.sma = 103.0;

        let p = params(Regime::Ranging);
        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Ranging, &snap),
            &p,
            1_000,
        );
        assert!(out.signal.is_none());
        assert!(out
            .rejections
            .iter()
            .any(|r| r.reason.contains("below threshold")));
    }

    #[test]
    fn no_detector_no_candidate() {
        let snap = base_snapshot();
        let p = params(Regime::Ranging);
        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Ranging, &snap),
            &p,
            1_000,
        );
        assert!(out.signal.is_none());
        assert!(out.rejections.is_empty());
    }

    #[test]
    fn impulse_bar_detection() {
        let bar = Bar {
            open_time: 0,
            close_time: 60_000,
            open: 100.0,
            high: 103.2,
            low: 99.8,
            close: 103.0,
            volume: 50.0,
        };
        assert!(impulse_bar(Side::Long, Some(&bar)));
        assert!(!impulse_bar(Side::Short, Some(&bar)));
        assert!(!impulse_bar(Side::Long, None));

        let doji = Bar {
            open: 100.0,
            close: 100.1,
            ..bar
        };
        assert!(!impulse_bar(Side::Long, Some(&doji)));
    }

    #[test]
    fn choppy_raised_threshold_blocks_marginal_score() {
        // Default choppy override raises min_score_threshold to 9.0.
        let mut snap = strong_long_snapshot();
        snap.macd_crossed_up = false;
        snap.macd_histogram = -0.1; // lose the MACD points
        snap.volume_ratio = 1.0; // lose volume confirmation

        let p_choppy = params(Regime::Choppy);
        let p_ranging = params(Regime::Ranging);
        assert!(p_choppy.min_score_threshold > p_ranging.min_score_threshold);

        let out = SignalGenerator::evaluate(
            "BTC-USDT-SWAP",
            &snap,
            None,
            &reading(Regime::Choppy, &snap),
            &p_choppy,
            1_000,
        );
        assert!(out.signal.is_none());
    }
}
