// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder-smooth all three over `period`.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, likewise -DI.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder-smoothed average of DX.
//
// The regime classifier needs both trend strength (ADX) and direction
// agreement (+DI vs -DI), so the full triple is returned.
// =============================================================================

use crate::market_data::Bar;

/// ADX plus the directional components it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalIndex {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

impl DirectionalIndex {
    /// The signed direction the DI pair agrees on: +1 bullish, -1 bearish,
    /// 0 when the components are equal.
    pub fn direction(&self) -> i8 {
        if self.plus_di > self.minus_di {
            1
        } else if self.minus_di > self.plus_di {
            -1
        } else {
            0
        }
    }
}

/// Compute the most recent [`DirectionalIndex`] from `bars` (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `2 * period + 1` bars
/// are available (one Wilder pass for DM/TR, a second for the DX average,
/// plus the first bar that has no predecessor), or a divisor degenerates.
pub fn directional_index(bars: &[Bar], period: usize) -> Option<DirectionalIndex> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = bars.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_high = bars[i - 1].high;
        let prev_low = bars[i - 1].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    let (mut plus_di, mut minus_di, dx) = components(smooth_plus, smooth_minus, smooth_tr)?;
    dx_values.push(dx);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        let (p, m, dx) = components(smooth_plus, smooth_minus, smooth_tr)?;
        plus_di = p;
        minus_di = m;
        dx_values.push(dx);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    if !adx.is_finite() {
        return None;
    }

    Some(DirectionalIndex {
        adx,
        plus_di,
        minus_di,
    })
}

/// (+DI, -DI, DX) from the smoothed accumulators, or `None` on degenerate TR.
fn components(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus / smooth_tr) * 100.0;
    let minus_di = (smooth_minus / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0
    } else {
        ((plus_di - minus_di).abs() / di_sum) * 100.0
    };

    (plus_di.is_finite() && minus_di.is_finite() && dx.is_finite())
        .then_some((plus_di, minus_di, dx))
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
            volume: 1.0,
        }
    }

    #[test]
    fn degenerate_inputs() {
        let bars = vec![bar(1.0, 2.0, 0.5, 1.5); 50];
        assert!(directional_index(&bars, 0).is_none());
        assert!(directional_index(&bars[..10], 14).is_none());
    }

    #[test]
    fn strong_uptrend_bullish_and_strong() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let di = directional_index(&bars, 14).unwrap();
        assert!(di.adx > 25.0, "expected strong trend, got ADX {}", di.adx);
        assert!(di.plus_di > di.minus_di);
        assert_eq!(di.direction(), 1);
    }

    #[test]
    fn strong_downtrend_bearish() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                bar(base, base + 0.5, base - 1.5, base - 1.0)
            })
            .collect();
        let di = directional_index(&bars, 14).unwrap();
        assert!(di.adx > 25.0);
        assert_eq!(di.direction(), -1);
    }

    #[test]
    fn flat_market_near_zero_adx() {
        let bars = vec![bar(100.0, 101.0, 99.0, 100.0); 60];
        let di = directional_index(&bars, 14).unwrap();
        assert!(di.adx < 1.0, "expected ADX near 0, got {}", di.adx);
    }

    #[test]
    fn bounded_range() {
        let bars: Vec<Bar> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                bar(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(di) = directional_index(&bars, 14) {
            assert!((0.0..=100.0).contains(&di.adx));
            assert!(di.plus_di >= 0.0 && di.minus_di >= 0.0);
        }
    }

    #[test]
    fn minimum_bar_count_boundary() {
        let period = 5;
        let min = 2 * period + 1;
        let bars: Vec<Bar> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(directional_index(&bars, period).is_some());
        assert!(directional_index(&bars[..min - 1], period).is_none());
    }
}
