// =============================================================================
// Indicator Engine
// =============================================================================
//
// Pure calculators (one file per indicator, every public function returns
// `Option`/empty on insufficient data) plus the stateful `IndicatorEngine`
// that maintains the per-(symbol, timeframe) snapshot cache.
//
// All values are computed on closed bars plus the current forming bar's last
// price; no computation ever reads an index beyond the current one. On
// insufficient history the snapshot is `None` and every dependent check
// short-circuits to a negative (no signal, no trade).

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::{Bar, BarKey, Timeframe};

pub use adx::DirectionalIndex;
pub use bollinger::BollingerBands;
pub use macd::MacdResult;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Direction of the EMA stack relative to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Complete per-(symbol, timeframe) indicator reading. Overwritten on every
/// tick; consumers never hold references across cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub atr: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub macd_crossed_up: bool,
    pub macd_crossed_down: bool,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    /// ATR as a percentage of the last price.
    pub volatility_percent: f64,
    pub trend_direction: TrendDirection,
    pub bb_upper: f64,
    pub bb_lower: f64,
    pub bb_width_percent: f64,
    pub sma: f64,
    /// Last bar volume relative to the trailing average.
    pub volume_ratio: f64,
    /// Close-to-close direction flips inside the reversal window.
    pub reversal_count: usize,
    pub last_price: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Fixed calculation periods. EMA fast/slow are regime-conditioned and are
/// passed per update from the resolved parameter set.
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub sma_period: usize,
    pub volume_lookback: usize,
    pub reversal_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            atr_period: 14,
            adx_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std: 2.0,
            sma_period: 20,
            volume_lookback: 20,
            reversal_window: 10,
        }
    }
}

/// Maintains the latest [`IndicatorSnapshot`] per (symbol, timeframe).
///
/// `reset` drops the cached snapshot whenever the underlying bar series is
/// rebuilt (history refetch, regime switch) so stateful smoothing cannot
/// serve values derived from a superseded series.
pub struct IndicatorEngine {
    config: IndicatorConfig,
    snapshots: RwLock<HashMap<BarKey, IndicatorSnapshot>>,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Recompute the snapshot for (symbol, timeframe) from closed `bars`
    /// plus the forming bar's last price.
    ///
    /// Returns `None` (and leaves no cached value) when history is too short
    /// for any constituent indicator.
    pub fn update(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
        forming_price: Option<f64>,
        ema_fast_period: usize,
        ema_slow_period: usize,
    ) -> Option<IndicatorSnapshot> {
        let key = BarKey::new(symbol, timeframe);

        let snapshot = match compute_snapshot(
            &self.config,
            bars,
            forming_price,
            ema_fast_period,
            ema_slow_period,
        ) {
            Some(s) => s,
            None => {
                debug!(key = %key, bars = bars.len(), "insufficient history for indicators");
                self.snapshots.write().remove(&key);
                return None;
            }
        };

        self.snapshots.write().insert(key, snapshot.clone());
        Some(snapshot)
    }

    /// Latest cached snapshot without recomputation.
    pub fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<IndicatorSnapshot> {
        self.snapshots
            .read()
            .get(&BarKey::new(symbol, timeframe))
            .cloned()
    }

    /// Drop the cached snapshot for one series.
    pub fn reset(&self, symbol: &str, timeframe: Timeframe) {
        self.snapshots
            .write()
            .remove(&BarKey::new(symbol, timeframe));
        debug!(symbol, timeframe = %timeframe, "indicator state reset");
    }

    /// Drop every cached snapshot for `symbol` (all timeframes). Called on
    /// regime switches.
    pub fn reset_symbol(&self, symbol: &str) {
        self.snapshots.write().retain(|k, _| k.symbol != symbol);
        debug!(symbol, "indicator state reset (all timeframes)");
    }
}

impl std::fmt::Debug for IndicatorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorEngine")
            .field("cached_series", &self.snapshots.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Snapshot assembly
// ---------------------------------------------------------------------------

fn compute_snapshot(
    config: &IndicatorConfig,
    bars: &[Bar],
    forming_price: Option<f64>,
    ema_fast_period: usize,
    ema_slow_period: usize,
) -> Option<IndicatorSnapshot> {
    if bars.is_empty() {
        return None;
    }

    // Closed closes plus the forming bar's last price as the newest element.
    let mut closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    if let Some(px) = forming_price {
        if px > 0.0 {
            closes.push(px);
        }
    }
    let last_price = *closes.last()?;

    let rsi = rsi::latest_rsi(&closes, config.rsi_period)?;
    let (ema_fast, ema_slow) = ema::ema_pair(&closes, ema_fast_period, ema_slow_period)?;
    let atr_value = atr::atr(bars, config.atr_period)?;
    let volatility_percent = if last_price > 0.0 {
        (atr_value / last_price) * 100.0
    } else {
        return None;
    };
    let macd_result = macd::macd(
        &closes,
        config.macd_fast,
        config.macd_slow,
        config.macd_signal,
    )?;
    let di = adx::directional_index(bars, config.adx_period)?;
    let bands = bollinger::bollinger(&closes, config.bollinger_period, config.bollinger_std)?;
    let sma_value = ema::sma(&closes, config.sma_period)?;

    let trend_direction = if ema_fast > ema_slow && last_price > ema_fast {
        TrendDirection::Bullish
    } else if ema_fast < ema_slow && last_price < ema_fast {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    };

    let volume_ratio = volume_ratio(bars, config.volume_lookback);
    let reversal_count = reversal_count(&closes, config.reversal_window);

    Some(IndicatorSnapshot {
        rsi,
        ema_fast,
        ema_slow,
        atr: atr_value,
        macd_line: macd_result.line,
        macd_signal: macd_result.signal,
        macd_histogram: macd_result.histogram,
        macd_crossed_up: macd_result.crossed_up(),
        macd_crossed_down: macd_result.crossed_down(),
        adx: di.adx,
        plus_di: di.plus_di,
        minus_di: di.minus_di,
        volatility_percent,
        trend_direction,
        bb_upper: bands.upper,
        bb_lower: bands.lower,
        bb_width_percent: bands.width_percent,
        sma: sma_value,
        volume_ratio,
        reversal_count,
        last_price,
    })
}

/// Last bar volume over the trailing average (1.0 when history is short).
fn volume_ratio(bars: &[Bar], lookback: usize) -> f64 {
    if bars.len() < 2 || lookback == 0 {
        return 1.0;
    }
    let window_start = bars.len().saturating_sub(lookback + 1);
    let window = &bars[window_start..bars.len() - 1];
    if window.is_empty() {
        return 1.0;
    }
    let avg: f64 = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    let last = bars[bars.len() - 1].volume;
    (last / avg).max(0.0)
}

/// Count close-to-close direction flips inside the trailing `window` closes.
fn reversal_count(closes: &[f64], window: usize) -> usize {
    if closes.len() < 3 || window < 3 {
        return 0;
    }
    let start = closes.len().saturating_sub(window);
    let slice = &closes[start..];

    let mut flips = 0;
    let mut prev_sign = 0i8;
    for w in slice.windows(2) {
        let delta = w[1] - w[0];
        let sign = if delta > 0.0 {
            1
        } else if delta < 0.0 {
            -1
        } else {
            0
        };
        if sign != 0 && prev_sign != 0 && sign != prev_sign {
            flips += 1;
        }
        if sign != 0 {
            prev_sign = sign;
        }
    }
    flips
}

/// Shared test fixture: a neutral snapshot tests mutate field-by-field.
#[cfg(test)]
pub(crate) fn test_snapshot() -> IndicatorSnapshot {
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

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                Bar {
                    open_time: i as i64 * 60_000,
                    close_time: (i as i64 + 1) * 60_000,
                    open: base,
                    high: base + 1.5,
                    low: base - 0.5,
                    close: base + 1.0,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn engine() -> IndicatorEngine {
        IndicatorEngine::new(IndicatorConfig::default())
    }

    #[test]
    fn insufficient_history_returns_none() {
        let eng = engine();
        let bars = trending_bars(10);
        assert!(eng
            .update("BTC-USDT-SWAP", Timeframe::M5, &bars, None, 9, 21)
            .is_none());
        assert!(eng.snapshot("BTC-USDT-SWAP", Timeframe::M5).is_none());
    }

    #[test]
    fn full_snapshot_on_trending_series() {
        let eng = engine();
        let bars = trending_bars(80);
        let snap = eng
            .update("BTC-USDT-SWAP", Timeframe::M5, &bars, None, 9, 21)
            .unwrap();

        assert!(snap.adx > 25.0);
        assert!(snap.plus_di > snap.minus_di);
        assert_eq!(snap.trend_direction, TrendDirection::Bullish);
        assert!(snap.ema_fast > snap.ema_slow);
        assert!(snap.volatility_percent > 0.0);
        assert!((0.0..=100.0).contains(&snap.rsi));

        // Cached copy matches.
        let cached = eng.snapshot("BTC-USDT-SWAP", Timeframe::M5).unwrap();
        assert!((cached.rsi - snap.rsi).abs() < 1e-12);
    }

    #[test]
    fn forming_price_shifts_last_price() {
        let eng = engine();
        let bars = trending_bars(80);
        let snap = eng
            .update("BTC-USDT-SWAP", Timeframe::M5, &bars, Some(500.0), 9, 21)
            .unwrap();
        assert!((snap.last_price - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_drops_cache() {
        let eng = engine();
        let bars = trending_bars(80);
        eng.update("ETH-USDT-SWAP", Timeframe::M1, &bars, None, 9, 21)
            .unwrap();
        eng.reset("ETH-USDT-SWAP", Timeframe::M1);
        assert!(eng.snapshot("ETH-USDT-SWAP", Timeframe::M1).is_none());
    }

    #[test]
    fn reset_symbol_clears_all_timeframes() {
        let eng = engine();
        let bars = trending_bars(80);
        eng.update("ETH-USDT-SWAP", Timeframe::M1, &bars, None, 9, 21);
        eng.update("ETH-USDT-SWAP", Timeframe::M5, &bars, None, 9, 21);
        eng.update("BTC-USDT-SWAP", Timeframe::M5, &bars, None, 9, 21);
        eng.reset_symbol("ETH-USDT-SWAP");
        assert!(eng.snapshot("ETH-USDT-SWAP", Timeframe::M1).is_none());
        assert!(eng.snapshot("ETH-USDT-SWAP", Timeframe::M5).is_none());
        assert!(eng.snapshot("BTC-USDT-SWAP", Timeframe::M5).is_some());
    }

    #[test]
    fn reversal_count_zigzag() {
        let closes = vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        assert_eq!(reversal_count(&closes, 10), 4);

        let monotone: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert_eq!(reversal_count(&monotone, 10), 0);
    }

    #[test]
    fn volume_ratio_spike() {
        let mut bars = trending_bars(30);
        if let Some(last) = bars.last_mut() {
            last.volume = 50.0; // 5x the steady 10.0
        }
        let ratio = volume_ratio(&bars, 20);
        assert!((ratio - 5.0).abs() < 1e-9, "got {ratio}");
    }
}
