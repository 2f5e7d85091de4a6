// =============================================================================
// Filter Pipeline — ordered predicate chain over admitted signals
// =============================================================================
//
// A signal must pass ALL filters to proceed. The order is fixed and
// significant:
//
//   ADX -> MTF -> Correlation -> Pivot -> VolumeProfile -> Liquidity
//       -> OrderFlow -> FundingRate
//
// Each filter returns (allowed, reason, optional score bonus). Passed filter
// names are appended to the signal's `filters_passed` in application order
// for auditability; the first rejection short-circuits the chain.

pub mod correlation;
pub mod mtf;
pub mod structure;

use tracing::debug;

use crate::market_data::MarketDataRegistry;
use crate::params::ParameterSet;
use crate::signals::Signal;
use crate::types::Side;

/// Verdict of a single filter.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub allowed: bool,
    pub reason: String,
    pub score_bonus: f64,
}

impl FilterVerdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            score_bonus: 0.0,
        }
    }

    pub fn pass_with_bonus(reason: impl Into<String>, bonus: f64) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            score_bonus: bonus,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            score_bonus: 0.0,
        }
    }
}

/// Outcome of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub allowed: bool,
    /// Name of the rejecting filter when blocked.
    pub rejected_by: Option<String>,
    pub reason: String,
    /// Sum of structural score bonuses granted along the way.
    pub total_bonus: f64,
}

/// Everything the filters are allowed to read. The pipeline itself holds no
/// market-data state.
pub struct FilterContext<'a> {
    pub registry: &'a MarketDataRegistry,
    pub params: &'a ParameterSet,
    /// The snapshot the signal was generated from.
    pub snapshot: &'a crate::indicators::IndicatorSnapshot,
    /// Symbols that currently have an open position (for correlation).
    pub open_symbols: &'a [String],
}

pub struct FilterPipeline;

impl FilterPipeline {
    /// Run the fixed chain over `signal`, recording passed filter names.
    /// The first rejection stops the chain; later filters never run.
    pub fn run(signal: &mut Signal, ctx: &FilterContext<'_>) -> PipelineOutcome {
        type Stage = for<'a, 'b> fn(&'a Signal, &'a FilterContext<'b>) -> FilterVerdict;

        let mut total_bonus = 0.0;

        let stages: [(&str, Stage); 8] = [
            ("adx", adx_filter),
            ("mtf", mtf::confirm),
            ("correlation", correlation::check),
            ("pivot", structure::pivot_bonus),
            ("volume_profile", structure::volume_profile_bonus),
            ("liquidity", liquidity_filter),
            ("order_flow", order_flow_filter),
            ("funding_rate", funding_rate_filter),
        ];

        for (name, stage) in stages {
            let verdict = stage(signal, ctx);
            if !verdict.allowed {
                debug!(
                    symbol = %signal.symbol,
                    side = %signal.side,
                    filter = name,
                    reason = %verdict.reason,
                    "signal rejected by filter"
                );
                return PipelineOutcome {
                    allowed: false,
                    rejected_by: Some(name.to_string()),
                    reason: verdict.reason,
                    total_bonus,
                };
            }
            total_bonus += verdict.score_bonus;
            signal.filters_passed.push(name.to_string());
        }

        signal.score += total_bonus;
        PipelineOutcome {
            allowed: true,
            rejected_by: None,
            reason: "all filters passed".to_string(),
            total_bonus,
        }
    }
}

// ---------------------------------------------------------------------------
// Inline filters (ADX, liquidity, order flow, funding)
// ---------------------------------------------------------------------------

/// Reject signals that contradict an established trend: once ADX is at or
/// above the threshold, only the DI-agreeing side may trade.
fn adx_filter(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let snap = ctx.snapshot;
    if snap.adx < ctx.params.adx_threshold {
        return FilterVerdict::pass(format!("adx {:.1} below trend threshold", snap.adx));
    }

    let trend_side = if snap.plus_di > snap.minus_di {
        Some(Side::Long)
    } else if snap.minus_di > snap.plus_di {
        Some(Side::Short)
    } else {
        None
    };

    match trend_side {
        Some(trend) if signal.side != trend => FilterVerdict::reject(format!(
            "{} signal contradicts {} trend (adx {:.1})",
            signal.side, trend, snap.adx
        )),
        _ => FilterVerdict::pass(format!("adx {:.1} trend agrees", snap.adx)),
    }
}

/// Top-of-book notional and cumulative depth must clear symbol minimums.
fn liquidity_filter(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let book = match ctx.registry.get_book(&signal.symbol) {
        Some(b) => b,
        None => return FilterVerdict::reject("no order book available"),
    };

    if book.best_bid <= 0.0 || book.best_ask <= 0.0 {
        return FilterVerdict::reject("book has no two-sided quote");
    }

    let top_notional = (book.bid_size * book.best_bid).min(book.ask_size * book.best_ask);
    if top_notional < ctx.params.min_top_notional_usd {
        return FilterVerdict::reject(format!(
            "top-of-book notional {:.0} below minimum {:.0}",
            top_notional, ctx.params.min_top_notional_usd
        ));
    }

    let depth_notional = book.bid_depth * book.best_bid + book.ask_depth * book.best_ask;
    if depth_notional < ctx.params.min_book_depth_usd {
        return FilterVerdict::reject(format!(
            "book depth {:.0} below minimum {:.0}",
            depth_notional, ctx.params.min_book_depth_usd
        ));
    }

    FilterVerdict::pass("liquidity sufficient")
}

/// Signed book imbalance must exceed the side-appropriate threshold:
/// delta = (bid_vol - ask_vol) / (bid_vol + ask_vol).
fn order_flow_filter(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let book = match ctx.registry.get_book(&signal.symbol) {
        Some(b) => b,
        None => return FilterVerdict::reject("no order book for flow check"),
    };

    let threshold = ctx.params.orderflow_delta_threshold;
    let ok = match signal.side {
        Side::Long => book.imbalance >= threshold,
        Side::Short => book.imbalance <= -threshold,
    };

    if ok {
        FilterVerdict::pass(format!("imbalance {:.3} confirms {}", book.imbalance, signal.side))
    } else {
        FilterVerdict::reject(format!(
            "imbalance {:.3} does not confirm {} (threshold {:.3})",
            book.imbalance, signal.side, threshold
        ))
    }
}

/// Reject entries whose side would pay funding above the configured maximum.
/// Longs pay positive rates, shorts pay negative rates.
fn funding_rate_filter(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    let snapshot = match ctx.registry.get_funding(&signal.symbol) {
        Some(s) => s,
        // Funding updates are sparse; absence is not a veto.
        None => return FilterVerdict::pass("no funding data"),
    };

    let paying = match signal.side {
        Side::Long => snapshot.rate,
        Side::Short => -snapshot.rate,
    };

    if paying > ctx.params.max_funding_rate {
        FilterVerdict::reject(format!(
            "{} would pay funding {:.5} above maximum {:.5}",
            signal.side, paying, ctx.params.max_funding_rate
        ))
    } else {
        FilterVerdict::pass("funding acceptable")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::market_data::{BookTop, FundingSnapshot};
    use crate::params::ParameterResolver;
    use crate::regime::Regime;
    use crate::signals::SignalKind;
    use std::sync::Arc;

    fn signal(side: Side) -> Signal {
        Signal {
            symbol: "BTC-USDT-SWAP".to_string(),
            side,
            kind: SignalKind::MacdCross,
            score: 8.0,
            strength: 0.7,
            confidence: 0.7,
            regime: Regime::Ranging,
            reference_price: 37_000.0,
            filters_passed: Vec::new(),
            ts_ms: 0,
        }
    }

    fn params() -> Arc<crate::params::ParameterSet> {
        ParameterResolver::new(EngineConfig::default()).resolve(
            "BTC-USDT-SWAP",
            Regime::Ranging,
            5_000.0,
        )
    }

    fn neutral_snapshot() -> crate::indicators::IndicatorSnapshot {
        let mut s = crate::indicators::test_snapshot();
        s.last_price = 37_000.0;
        s
    }

    fn deep_book(imbalance_sign: f64) -> BookTop {
        // Roughly $74M of bids at best, comfortably above minimums.
        let (bid_depth, ask_depth) = if imbalance_sign >= 0.0 {
            (80.0, 40.0)
        } else {
            (40.0, 80.0)
        };
        BookTop {
            symbol: "BTC-USDT-SWAP".to_string(),
            best_bid: 37_000.0,
            best_ask: 37_001.0,
            bid_size: 2.0,
            ask_size: 2.0,
            bid_depth,
            ask_depth,
            spread_bps: 0.3,
            imbalance: (bid_depth - ask_depth) / (bid_depth + ask_depth),
            ts_ms: 1,
        }
    }

    #[test]
    fn liquidity_rejects_missing_book() {
        let registry = MarketDataRegistry::new(10);
        let p = params();
        let sig = signal(Side::Long);
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };
        let verdict = liquidity_filter(&sig, &ctx);
        assert!(!verdict.allowed);
    }

    #[test]
    fn liquidity_rejects_thin_top() {
        let registry = MarketDataRegistry::new(10);
        let mut book = deep_book(1.0);
        book.bid_size = 0.0001; // ~ $3.7 at the top
        registry.update_book(book);
        let p = params();
        let sig = signal(Side::Long);
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };
        let verdict = liquidity_filter(&sig, &ctx);
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("top-of-book"));
    }

    #[test]
    fn order_flow_side_asymmetry() {
        let registry = MarketDataRegistry::new(10);
        registry.update_book(deep_book(1.0)); // bid-heavy: delta = +1/3
        let p = params();
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };

        assert!(order_flow_filter(&signal(Side::Long), &ctx).allowed);
        assert!(!order_flow_filter(&signal(Side::Short), &ctx).allowed);
    }

    #[test]
    fn funding_rejects_expensive_side_only() {
        let registry = MarketDataRegistry::new(10);
        registry.update_funding(FundingSnapshot {
            symbol: "BTC-USDT-SWAP".to_string(),
            rate: 0.001, // longs pay 0.1% — above the 0.0005 default cap
            next_funding_time_ms: 0,
            ts_ms: 1,
        });
        let p = params();
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };

        assert!(!funding_rate_filter(&signal(Side::Long), &ctx).allowed);
        // Shorts RECEIVE positive funding — allowed.
        assert!(funding_rate_filter(&signal(Side::Short), &ctx).allowed);
    }

    #[test]
    fn pipeline_records_passed_filters_in_order() {
        let registry = MarketDataRegistry::new(10);
        registry.update_book(deep_book(1.0));
        // Seed enough M5/M15/H1 history for MTF + structure filters.
        seed_trending_bars(&registry, "BTC-USDT-SWAP");

        let p = params();
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };
        let mut sig = signal(Side::Long);
        let outcome = FilterPipeline::run(&mut sig, &ctx);

        assert!(outcome.allowed, "reason: {}", outcome.reason);
        assert_eq!(
            sig.filters_passed,
            vec![
                "adx",
                "mtf",
                "correlation",
                "pivot",
                "volume_profile",
                "liquidity",
                "order_flow",
                "funding_rate"
            ]
        );
    }

    #[test]
    fn pipeline_short_circuits_on_rejection() {
        let registry = MarketDataRegistry::new(10);
        // Ask-heavy book: long fails the order-flow filter after passing
        // liquidity.
        registry.update_book(deep_book(-1.0));
        seed_trending_bars(&registry, "BTC-USDT-SWAP");

        let p = params();
        let snap = neutral_snapshot();
        let ctx = FilterContext {
            registry: &registry,
            params: &p,
            snapshot: &snap,
            open_symbols: &[],
        };
        let mut sig = signal(Side::Long);
        let outcome = FilterPipeline::run(&mut sig, &ctx);

        assert!(!outcome.allowed);
        assert_eq!(outcome.rejected_by.as_deref(), Some("order_flow"));
        // Everything before the rejection is recorded, nothing after.
        assert_eq!(
            sig.filters_passed,
            vec!["adx", "mtf", "correlation", "pivot", "volume_profile", "liquidity"]
        );
    }

    /// Seed rising bars on every timeframe the filters consult.
    pub(crate) fn seed_trending_bars(registry: &MarketDataRegistry, symbol: &str) {
        use crate::market_data::{Bar, BarKey, Timeframe};
        for tf in Timeframe::ALL {
            let step_ms = tf.secs() as i64 * 1000;
            for i in 0..120i64 {
                let base = 36_000.0 + i as f64 * 10.0;
                registry.update_bar(
                    BarKey::new(symbol, tf),
                    Bar {
                        open_time: i * step_ms,
                        close_time: (i + 1) * step_ms,
                        open: base,
                        high: base + 20.0,
                        low: base - 10.0,
                        close: base + 10.0,
                        volume: 100.0,
                    },
                );
            }
        }
    }
}
