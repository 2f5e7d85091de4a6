// =============================================================================
// Structural filters — pivot levels and volume profile
// =============================================================================
//
// Neither filter vetoes a trade; both grant a score bonus when the entry
// sits next to supportive structure:
//
//   - Pivot: classic floor-trader pivots (P, S1/S2, R1/R2) from the trailing
//     24 hourly bars. A long near support or a short near resistance earns
//     the bonus.
//   - Volume profile: volume-weighted price histogram over the trailing 5m
//     bars; an entry inside the 70% value area close to the point of control
//     earns the bonus.
// =============================================================================

use crate::filters::{FilterContext, FilterVerdict};
use crate::market_data::Timeframe;
use crate::signals::Signal;
use crate::types::Side;

/// Bonus granted by each structural filter.
const STRUCTURE_BONUS: f64 = 0.5;

/// Entry must be within this fraction of price to a level to count as
/// "near".
const NEAR_LEVEL_FRACTION: f64 = 0.005;

/// Hourly bars aggregated into the pivot calculation.
const PIVOT_LOOKBACK_H1: usize = 24;

/// 5m bars in the volume profile window.
const PROFILE_LOOKBACK_M5: usize = 100;

/// Price buckets in the profile histogram.
const PROFILE_BUCKETS: usize = 24;

/// Fraction of total volume in the value area.
const VALUE_AREA_FRACTION: f64 = 0.70;

// ---------------------------------------------------------------------------
// Pivot
// ---------------------------------------------------------------------------

/// Classic pivot levels from an aggregated (high, low, close).
#[derive(Debug, Clone, Copy)]
pub struct PivotLevels {
    pub pivot: f64,
    pub s1: f64,
    pub s2: f64,
    pub r1: f64,
    pub r2: f64,
}

pub fn pivot_bonus(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let bars = ctx
        .registry
        .get_bars(&signal.symbol, Timeframe::H1, PIVOT_LOOKBACK_H1);
    if bars.is_empty() {
        return FilterVerdict::pass("no hourly history for pivots");
    }

    let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let close = bars.last().map(|b| b.close).unwrap_or(0.0);
    if close <= 0.0 || high <= low {
        return FilterVerdict::pass("degenerate hourly range");
    }

    let levels = pivot_levels(high, low, close);
    let price = signal.reference_price;

    let supportive = match signal.side {
        Side::Long => [levels.s1, levels.s2, levels.pivot]
            .iter()
            .any(|level| near(price, *level)),
        Side::Short => [levels.r1, levels.r2, levels.pivot]
            .iter()
            .any(|level| near(price, *level)),
    };

    if supportive {
        FilterVerdict::pass_with_bonus(
            format!("entry near supportive pivot structure (P {:.2})", levels.pivot),
            STRUCTURE_BONUS,
        )
    } else {
        FilterVerdict::pass("no nearby pivot structure")
    }
}

fn pivot_levels(high: f64, low: f64, close: f64) -> PivotLevels {
    let pivot = (high + low + close) / 3.0;
    PivotLevels {
        pivot,
        s1: 2.0 * pivot - high,
        s2: pivot - (high - low),
        r1: 2.0 * pivot - low,
        r2: pivot + (high - low),
    }
}

fn near(price: f64, level: f64) -> bool {
    if price <= 0.0 {
        return false;
    }
    ((price - level).abs() / price) <= NEAR_LEVEL_FRACTION
}

// ---------------------------------------------------------------------------
// Volume profile
// ---------------------------------------------------------------------------

/// Point of control and value-area bounds of a volume histogram.
#[derive(Debug, Clone, Copy)]
pub struct VolumeProfile {
    pub poc: f64,
    pub value_area_low: f64,
    pub value_area_high: f64,
}

pub fn volume_profile_bonus(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let bars = ctx
        .registry
        .get_bars(&signal.symbol, Timeframe::M5, PROFILE_LOOKBACK_M5);
    if bars.len() < PROFILE_LOOKBACK_M5 / 2 {
        return FilterVerdict::pass("insufficient history for volume profile");
    }

    let typical_prices: Vec<(f64, f64)> = bars
        .iter()
        .map(|b| ((b.high + b.low + b.close) / 3.0, b.volume))
        .collect();

    let profile = match build_profile(&typical_prices) {
        Some(p) => p,
        None => return FilterVerdict::pass("degenerate volume profile"),
    };

    let price = signal.reference_price;
    let in_value_area = price >= profile.value_area_low && price <= profile.value_area_high;
    let near_poc = near(price, profile.poc);

    if in_value_area && near_poc {
        FilterVerdict::pass_with_bonus(
            format!("entry inside value area near POC {:.2}", profile.poc),
            STRUCTURE_BONUS,
        )
    } else if in_value_area {
        FilterVerdict::pass("entry inside value area")
    } else {
        FilterVerdict::pass("entry outside value area")
    }
}

/// Histogram the (price, volume) pairs and derive POC plus a value area
/// holding [`VALUE_AREA_FRACTION`] of total volume, expanding outward from
/// the POC bucket.
fn build_profile(samples: &[(f64, f64)]) -> Option<VolumeProfile> {
    let min = samples.iter().map(|(p, _)| *p).fold(f64::MAX, f64::min);
    let max = samples.iter().map(|(p, _)| *p).fold(f64::MIN, f64::max);
    if !(min.is_finite() && max.is_finite()) || max <= min {
        return None;
    }

    let bucket_width = (max - min) / PROFILE_BUCKETS as f64;
    let mut buckets = vec![0.0_f64; PROFILE_BUCKETS];
    for &(price, volume) in samples {
        let idx = (((price - min) / bucket_width) as usize).min(PROFILE_BUCKETS - 1);
        buckets[idx] += volume;
    }

    let total: f64 = buckets.iter().sum();
    if total <= 0.0 {
        return None;
    }

    let poc_idx = buckets
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)?;

    // Expand outward from the POC until the value area holds enough volume.
    let mut lo = poc_idx;
    let mut hi = poc_idx;
    let mut captured = buckets[poc_idx];
    while captured / total < VALUE_AREA_FRACTION && (lo > 0 || hi < PROFILE_BUCKETS - 1) {
        let below = if lo > 0 { buckets[lo - 1] } else { -1.0 };
        let above = if hi < PROFILE_BUCKETS - 1 {
            buckets[hi + 1]
        } else {
            -1.0
        };
        if below >= above {
            lo -= 1;
            captured += buckets[lo];
        } else {
            hi += 1;
            captured += buckets[hi];
        }
    }

    let bucket_mid = |i: usize| min + (i as f64 + 0.5) * bucket_width;
    Some(VolumeProfile {
        poc: bucket_mid(poc_idx),
        value_area_low: min + lo as f64 * bucket_width,
        value_area_high: min + (hi as f64 + 1.0) * bucket_width,
    })
}
