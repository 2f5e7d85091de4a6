// =============================================================================
// Correlation Filter — portfolio concentration guard
// =============================================================================
//
// Rejects a candidate when opening it would hold a position whose 5-minute
// return series correlates (|rho| above the limit) with any already-open
// position over the rolling lookback. Two highly correlated perps are one
// trade wearing two tickers.
// =============================================================================

use crate::filters::{FilterContext, FilterVerdict};
use crate::market_data::Timeframe;
use crate::signals::Signal;

/// Reject when |rho| with any open position exceeds the configured limit.
pub fn check(signal: &Signal, ctx: &FilterContext<'_>) -> FilterVerdict {
    if ctx.open_symbols.is_empty() {
        return FilterVerdict::pass("no open positions");
    }

    let lookback = ctx.params.correlation_lookback;
    let candidate_returns = return_series(ctx, &signal.symbol, lookback);
    if candidate_returns.len() < lookback / 2 {
        // Cannot establish correlation against a short series; the pairs we
        // cannot measure are skipped rather than guessed.
        return FilterVerdict::pass("insufficient history to measure correlation");
    }

    for open_symbol in ctx.open_symbols {
        if open_symbol == &signal.symbol {
            continue;
        }
        let other_returns = return_series(ctx, open_symbol, lookback);
        let n = candidate_returns.len().min(other_returns.len());
        if n < lookback / 2 {
            continue;
        }

        let a = &candidate_returns[candidate_returns.len() - n..];
        let b = &other_returns[other_returns.len() - n..];

        if let Some(rho) = pearson(a, b) {
            if rho.abs() > ctx.params.correlation_limit {
                return FilterVerdict::reject(format!(
                    "correlation {:.2} with open {} exceeds limit {:.2}",
                    rho, open_symbol, ctx.params.correlation_limit
                ));
            }
        }
    }

    FilterVerdict::pass("no blocking correlation")
}

/// Close-to-close returns over the trailing `lookback` 5m bars.
fn return_series(ctx: &FilterContext<'_>, symbol: &str, lookback: usize) -> Vec<f64> {
    let closes = ctx.registry.get_closes(symbol, Timeframe::M5, lookback + 1);
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Pearson correlation coefficient; `None` when either series is degenerate.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let rho = cov / (var_a.sqrt() * var_b.sqrt());
    rho.is_finite().then_some(rho)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::market_data::{Bar, BarKey, MarketDataRegistry};
    use crate::params::ParameterResolver;
    use crate::regime::Regime;
    use crate::signals::SignalKind;
    use crate::types::Side;

    fn seed_series(registry: &MarketDataRegistry, symbol: &str, closes: &[f64]) {
        for (i, &close) in closes.iter().enumerate() {
            registry.update_bar(
                BarKey::new(symbol, Timeframe::M5),
                Bar {
                    open_time: i as i64 * 300_000,
                    close_time: (i as i64 + 1) * 300_000,
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 10.0,
                },
            );
        }
    }

    /// A wavy price path long enough for the default 50-bar lookback.
    fn wavy(scale: f64, phase: f64) -> Vec<f64> {
        (0..80)
            .map(|i| scale * (100.0 + (i as f64 * 0.5 + phase).sin() * 5.0))
            .collect()
    }

    fn verdict(registry: &MarketDataRegistry, open: &[String]) -> FilterVerdict {
        let params = ParameterResolver::new(EngineConfig::default()).resolve(
            "BTC-USDT-SWAP",
            Regime::Ranging,
            5_000.0,
        );
        let snapshot = crate::indicators::test_snapshot();
        let signal = Signal {
            symbol: "BTC-USDT-SWAP".to_string(),
            side: Side::Long,
            kind: SignalKind::MaAlign,
            score: 8.0,
            strength: 0.7,
            confidence: 0.7,
            regime: Regime::Ranging,
            reference_price: 100.0,
            filters_passed: Vec::new(),
            ts_ms: 0,
        };
        let ctx = FilterContext {
            registry,
            params: &params,
            snapshot: &snapshot,
            open_symbols: open,
        };
        check(&signal, &ctx)
    }

    #[test]
    fn no_open_positions_passes() {
        let registry = MarketDataRegistry::new(10);
        assert!(verdict(&registry, &[]).allowed);
    }

    #[test]
    fn identical_path_rejected() {
        let registry = MarketDataRegistry::new(10);
        // Same waveform scaled: returns are perfectly correlated.
        seed_series(&registry, "BTC-USDT-SWAP", &wavy(1.0, 0.0));
        seed_series(&registry, "ETH-USDT-SWAP", &wavy(0.1, 0.0));
        let v = verdict(&registry, &["ETH-USDT-SWAP".to_string()]);
        assert!(!v.allowed);
        assert!(v.reason.contains("correlation"));
    }

    #[test]
    fn uncorrelated_path_passes() {
        let registry = MarketDataRegistry::new(10);
        seed_series(&registry, "BTC-USDT-SWAP", &wavy(1.0, 0.0));
        // Quarter-period phase shift decorrelates the sampled returns.
        seed_series(&registry, "ETH-USDT-SWAP", &wavy(1.0, std::f64::consts::FRAC_PI_2));
        let v = verdict(&registry, &["ETH-USDT-SWAP".to_string()]);
        assert!(v.allowed, "reason: {}", v.reason);
    }

    #[test]
    fn short_history_passes_with_note() {
        let registry = MarketDataRegistry::new(10);
        seed_series(&registry, "BTC-USDT-SWAP", &wavy(1.0, 0.0)[..10]);
        let v = verdict(&registry, &["ETH-USDT-SWAP".to_string()]);
        assert!(v.allowed);
        assert!(v.reason.contains("insufficient"));
    }

    #[test]
    fn pearson_basics() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b).unwrap() - 1.0).abs() < 1e-12);

        let c = [4.0, 3.0, 2.0, 1.0];
        assert!((pearson(&a, &c).unwrap() + 1.0).abs() < 1e-12);

        let flat = [5.0, 5.0, 5.0, 5.0];
        assert!(pearson(&a, &flat).is_none());
    }
}
