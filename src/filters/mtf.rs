// =============================================================================
// Multi-Timeframe Confirmation — 15M + 1H EMA alignment
// =============================================================================
//
// A long requires the EMA(9)/EMA(21) stack to be bullish on BOTH higher
// timeframes; a short requires both bearish. Insufficient higher-timeframe
// history counts as a failed confirmation — undefined indicators
// short-circuit to a negative decision, never to a pass.
// =============================================================================

use crate::filters::{FilterContext, FilterVerdict};
use crate::indicators::ema::latest_ema;
use crate::market_data::Timeframe;
use crate::signals::Signal;
use crate::types::Side;

const FAST_PERIOD: usize = 9;
const SLOW_PERIOD: usize = 21;
const LOOKBACK: usize = 100;

/// Require higher-timeframe EMA alignment consistent with the signal side.
pub fn confirm(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let trend_15m = match timeframe_trend(ctx, &signal.symbol, Timeframe::M15) {
        Some(t) => t,
        None => return FilterVerdict::reject("insufficient 15m history for confirmation"),
    };
    let trend_1h = match timeframe_trend(ctx, &signal.symbol, Timeframe::H1) {
        Some(t) => t,
        None => return FilterVerdict::reject("insufficient 1h history for confirmation"),
    };

    let confirmed = match signal.side {
        Side::Long => trend_15m && trend_1h,
        Side::Short => !trend_15m && !trend_1h,
    };

    if confirmed {
        FilterVerdict::pass(format!(
            "15m {} / 1h {} confirm {}",
            label(trend_15m),
            label(trend_1h),
            signal.side
        ))
    } else {
        FilterVerdict::reject(format!(
            "15m {} / 1h {} do not confirm {}",
            label(trend_15m),
            label(trend_1h),
            signal.side
        ))
    }
}

/// `Some(true)` bullish, `Some(false)` bearish, `None` insufficient data.
fn timeframe_trend(ctx: &FilterContext<'_>, symbol: &str, tf: Timeframe) -> Option<bool> {
    let closes = ctx.registry.get_closes(symbol, tf, LOOKBACK);
    if closes.len() < SLOW_PERIOD {
        return None;
    }
    let fast = latest_ema(&closes, FAST_PERIOD)?;
    let slow = latest_ema(&closes, SLOW_PERIOD)?;
    Some(fast > slow)
}

fn label(bullish: bool) -> &'static str {
    if bullish {
        "bullish"
    } else {
        "bearish"
    }
}
