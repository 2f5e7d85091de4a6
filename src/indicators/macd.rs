// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line  = EMA(fast) - EMA(slow)
//   Signal     = EMA(signal_period) of the MACD line
//   Histogram  = MACD line - Signal
//
// A cross is only actionable when the histogram confirms it (same sign on
// the current bar), which the signal generator checks via `crossed_up` /
// `crossed_down` against the previous histogram value.
// =============================================================================

use crate::indicators::ema::ema_series;

/// Latest MACD reading plus the previous histogram value for cross
/// detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
    /// Histogram one bar earlier; `None` when the series is too short.
    pub prev_histogram: Option<f64>,
}

impl MacdResult {
    /// Bullish cross: histogram flipped from <= 0 to > 0.
    pub fn crossed_up(&self) -> bool {
        matches!(self.prev_histogram, Some(prev) if prev <= 0.0 && self.histogram > 0.0)
    }

    /// Bearish cross: histogram flipped from >= 0 to < 0.
    pub fn crossed_down(&self) -> bool {
        matches!(self.prev_histogram, Some(prev) if prev >= 0.0 && self.histogram < 0.0)
    }
}

/// Compute MACD over `closes` with the given periods.
///
/// Returns `None` when there is not enough history to seed
/// `slow + signal_period` values.
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: the slow series is shorter.
    let offset = fast_series.len().checked_sub(slow_series.len())?;
    let line_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[offset + i] - s)
        .collect();

    let signal_series = ema_series(&line_series, signal_period);
    let signal = *signal_series.last()?;
    let line = *line_series.last()?;
    let histogram = line - signal;

    let prev_histogram = if signal_series.len() >= 2 && line_series.len() >= 2 {
        let prev_line = line_series[line_series.len() - 2];
        let prev_signal = signal_series[signal_series.len() - 2];
        Some(prev_line - prev_signal)
    } else {
        None
    };

    (line.is_finite() && signal.is_finite()).then_some(MacdResult {
        line,
        signal,
        histogram,
        prev_histogram,
    })
}

/// MACD with the conventional 12/26/9 periods.
pub fn macd_default(closes: &[f64]) -> Option<MacdResult> {
    macd(closes, 12, 26, 9)
}
