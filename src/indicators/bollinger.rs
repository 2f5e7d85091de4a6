// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle ± k * σ. Band width
// (upper - lower) / middle * 100 is the volatility-expansion metric used by
// the regime classifier; the bands themselves feed the scorer's
// band-extreme contribution.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100.
    pub width_percent: f64,
}

/// Bollinger bands over the trailing `period` closes.
///
/// Returns `None` on insufficient data or a degenerate (zero) middle band.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width_percent = (upper - lower) / middle * 100.0;

    width_percent.is_finite().then_some(BollingerBands {
        upper,
        middle,
        lower,
        width_percent,
    })
}
