// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of the first `period` TR values, then
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period.
// =============================================================================

use crate::market_data::Bar;

/// Most recent ATR over `bars` (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `period + 1` bars are
/// available (each TR needs a predecessor), or an intermediate value is
/// non-finite.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut value = seed;
    for &tr in &tr_values[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    Some(value)
}

/// ATR expressed as a percentage of the latest close. Comparable across
/// instruments with different price scales; feeds `volatility_percent`.
pub fn atr_percent(bars: &[Bar], period: usize) -> Option<f64> {
    let value = atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some((value / last_close) * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn degenerate_inputs() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(atr(&bars, 0).is_none());
        assert!(atr(&bars[..10], 14).is_none());
    }

    #[test]
    fn constant_range_converges() {
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let value = atr(&bars, 14).unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ~10, got {value}");
    }

    #[test]
    fn gap_feeds_true_range() {
        // |H - prevClose| dominates after the gap up.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let value = atr(&bars, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn percent_form() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = atr_percent(&bars, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn zero_close_blocks_percent() {
        let mut bars: Vec<Bar> = (0..20)
            .map(|i| bar(10.0 + i as f64, 12.0 + i as f64, 9.0 + i as f64, 11.0 + i as f64))
            .collect();
        bars.push(bar(1.0, 1.0, 0.0, 0.0));
        assert!(atr_percent(&bars, 14).is_none());
    }

    #[test]
    fn nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(atr(&bars, 3).is_none());
    }
}
