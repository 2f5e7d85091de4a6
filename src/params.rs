// =============================================================================
// ParameterResolver — layered configuration resolution, narrowest wins
// =============================================================================
//
// Layer order (applied widest to narrowest so later layers win):
//
//   global defaults -> balance profile -> regime override -> symbol profile
//
// Resolution happens once per (symbol, regime, balance tier); downstream
// components receive fully-resolved immutable values and never walk the raw
// config. The cache is invalidated on configuration reload and on regime
// switches.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BalanceProfile, EngineConfig, RegimeOverride};
use crate::regime::Regime;

// ---------------------------------------------------------------------------
// Balance tiers
// ---------------------------------------------------------------------------

/// Equity band bucket governing sizing caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceTier {
    Micro,
    Small,
    Medium,
    Large,
}

impl BalanceTier {
    /// Pick the bucket whose upper threshold the equity falls under.
    pub fn for_equity(config: &EngineConfig, equity_usd: f64) -> Self {
        let p = &config.scalping.balance_profiles;
        if equity_usd < p.micro.threshold {
            Self::Micro
        } else if equity_usd < p.small.threshold {
            Self::Small
        } else if equity_usd < p.medium.threshold {
            Self::Medium
        } else {
            Self::Large
        }
    }

    fn profile(self, config: &EngineConfig) -> &BalanceProfile {
        let p = &config.scalping.balance_profiles;
        match self {
            Self::Micro => &p.micro,
            Self::Small => &p.small,
            Self::Medium => &p.medium,
            Self::Large => &p.large,
        }
    }
}

impl std::fmt::Display for BalanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "micro"),
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved parameter set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTpParams {
    pub enabled: bool,
    pub fraction: f64,
    pub trigger_percent: f64,
    pub min_holding_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopParams {
    pub enabled: bool,
    pub activation_percent: f64,
    pub distance_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitDrawdownParams {
    pub drawdown_percent: f64,
    /// Regime-scaled multiplier applied to `drawdown_percent`.
    pub multiplier: f64,
    pub min_profit_to_activate_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitHarvestParams {
    pub enabled: bool,
    pub threshold_usd: f64,
    pub time_limit_seconds: u64,
    /// Immediate full close at this margin-basis PnL percent.
    pub big_profit_exit_percent: f64,
}

/// Effective per-(symbol, regime, balance-tier) configuration. Immutable
/// once resolved; shared via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    pub symbol: String,
    pub regime: Regime,
    pub balance_tier: BalanceTier,

    // Exits
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub tp_atr_mult: f64,
    pub sl_atr_mult: f64,
    pub max_holding_minutes: u64,
    pub extend_time_if_profitable: bool,
    pub min_profit_for_extension: f64,
    pub partial_tp: PartialTpParams,
    pub trailing_stop: TrailingStopParams,
    pub profit_drawdown: ProfitDrawdownParams,
    pub profit_harvest: ProfitHarvestParams,

    // Signals
    pub min_score_threshold: f64,
    pub min_signal_strength: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,

    // Risk / cooldown
    pub cooldown_after_loss_minutes: u64,

    // Sizing
    pub base_position_usd: f64,
    pub max_position_usd: f64,
    pub min_position_usd: f64,
    pub max_open_positions: u32,
    pub position_multiplier: f64,
    pub risk_per_trade_percent: f64,

    // Filters
    pub adx_threshold: f64,
    pub correlation_limit: f64,
    pub correlation_lookback: usize,
    pub min_top_notional_usd: f64,
    pub min_book_depth_usd: f64,
    pub orderflow_delta_threshold: f64,
    pub max_funding_rate: f64,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

type CacheKey = (String, Regime, BalanceTier);

/// Resolves and caches effective parameter sets.
pub struct ParameterResolver {
    config: RwLock<Arc<EngineConfig>>,
    cache: RwLock<HashMap<CacheKey, Arc<ParameterSet>>>,
}

impl ParameterResolver {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current immutable config snapshot.
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.read().clone()
    }

    /// Publish a new config snapshot and drop every cached resolution.
    pub fn reload(&self, config: EngineConfig) {
        *self.config.write() = Arc::new(config);
        self.cache.write().clear();
        debug!("parameter cache invalidated (config reload)");
    }

    /// Drop cached resolutions for `symbol` (called on regime switch).
    pub fn invalidate_symbol(&self, symbol: &str) {
        self.cache.write().retain(|(s, _, _), _| s != symbol);
        debug!(symbol, "parameter cache invalidated (regime switch)");
    }

    /// Resolve the effective parameter set for (symbol, regime) at the
    /// given account equity.
    pub fn resolve(&self, symbol: &str, regime: Regime, equity_usd: f64) -> Arc<ParameterSet> {
        let config = self.config();
        let tier = BalanceTier::for_equity(&config, equity_usd);
        let key = (symbol.to_string(), regime, tier);

        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }

        let resolved = Arc::new(resolve_layers(&config, symbol, regime, tier, equity_usd));
        self.cache.write().insert(key, resolved.clone());
        resolved
    }
}

impl std::fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterResolver")
            .field("cached_sets", &self.cache.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Layer application
// ---------------------------------------------------------------------------

fn resolve_layers(
    config: &EngineConfig,
    symbol: &str,
    regime: Regime,
    tier: BalanceTier,
    equity_usd: f64,
) -> ParameterSet {
    let scalping = &config.scalping;
    let profile = tier.profile(config);

    // ── Layer 1: global defaults ────────────────────────────────────────
    let big_profit = if EngineConfig::is_major(symbol) {
        scalping.big_profit_exit_percent_majors
    } else {
        scalping.big_profit_exit_percent_alts
    };

    let mut set = ParameterSet {
        symbol: symbol.to_string(),
        regime,
        balance_tier: tier,

        tp_percent: scalping.tp_percent,
        sl_percent: scalping.sl_percent,
        tp_atr_mult: scalping.tp_atr_mult,
        sl_atr_mult: scalping.sl_atr_mult,
        max_holding_minutes: scalping.max_holding_minutes,
        extend_time_if_profitable: scalping.extend_time_if_profitable,
        min_profit_for_extension: scalping.min_profit_for_extension,
        partial_tp: PartialTpParams {
            enabled: scalping.partial_tp.enabled,
            fraction: scalping.partial_tp.fraction,
            trigger_percent: scalping.partial_tp.trigger_percent,
            min_holding_secs: scalping.partial_tp.min_holding_secs,
        },
        trailing_stop: TrailingStopParams {
            enabled: scalping.trailing_stop.enabled,
            activation_percent: scalping.trailing_stop.activation_percent,
            distance_percent: scalping.trailing_stop.distance_percent,
        },
        profit_drawdown: ProfitDrawdownParams {
            drawdown_percent: scalping.profit_drawdown.drawdown_percent,
            multiplier: 1.0,
            min_profit_to_activate_usd: scalping.profit_drawdown.min_profit_to_activate_usd,
        },
        profit_harvest: ProfitHarvestParams {
            enabled: scalping.profit_harvest.enabled,
            threshold_usd: scalping.profit_harvest.threshold_usd,
            time_limit_seconds: scalping.profit_harvest.time_limit_seconds,
            big_profit_exit_percent: big_profit,
        },

        min_score_threshold: scalping.min_score_threshold,
        min_signal_strength: scalping.min_signal_strength,
        rsi_overbought: scalping.rsi_overbought,
        rsi_oversold: scalping.rsi_oversold,
        ema_fast_period: scalping.ema_fast,
        ema_slow_period: scalping.ema_slow,

        cooldown_after_loss_minutes: scalping.cooldown_after_loss_minutes,

        base_position_usd: profile.base_position_usd,
        max_position_usd: profile.max_position_usd,
        min_position_usd: config.min_position_usd,
        max_open_positions: profile.max_open_positions.min(config.risk.max_open_positions),
        position_multiplier: 1.0,
        risk_per_trade_percent: config.risk.risk_per_trade_percent,

        adx_threshold: config.filters.adx_threshold,
        correlation_limit: config.filters.correlation_limit,
        correlation_lookback: config.filters.correlation_lookback,
        min_top_notional_usd: config.filters.min_top_notional_usd,
        min_book_depth_usd: config.filters.min_book_depth_usd,
        orderflow_delta_threshold: config.filters.orderflow_delta_threshold,
        max_funding_rate: config.filters.max_funding_rate,
    };

    // ── Layer 2: balance profile (progressive size interpolation) ───────
    if profile.progressive && profile.size_at_max > profile.size_at_min {
        let lower = match tier {
            BalanceTier::Micro => 0.0,
            BalanceTier::Small => config.scalping.balance_profiles.micro.threshold,
            BalanceTier::Medium => config.scalping.balance_profiles.small.threshold,
            BalanceTier::Large => config.scalping.balance_profiles.medium.threshold,
        };
        let upper = profile.threshold;
        if upper > lower && upper.is_finite() {
            let t = ((equity_usd - lower) / (upper - lower)).clamp(0.0, 1.0);
            set.base_position_usd =
                profile.size_at_min + t * (profile.size_at_max - profile.size_at_min);
        }
    }

    // ── Layer 3: regime overrides ───────────────────────────────────────
    // The exit policies' own by_regime maps apply first; the broader
    // adaptive_regime block wins ties at the same narrowness.
    if let Some(o) = scalping.partial_tp.by_regime.get(regime.key()) {
        if let Some(v) = o.trigger_percent {
            set.partial_tp.trigger_percent = v;
        }
        if let Some(v) = o.fraction {
            set.partial_tp.fraction = v;
        }
    }
    if let Some(o) = scalping.profit_drawdown.by_regime.get(regime.key()) {
        if let Some(v) = o.multiplier {
            set.profit_drawdown.multiplier = v;
        }
    }

    let regime_override = match regime {
        Regime::Trending => &scalping.adaptive_regime.trending,
        Regime::Ranging => &scalping.adaptive_regime.ranging,
        Regime::Choppy => &scalping.adaptive_regime.choppy,
    };
    apply_override(&mut set, regime_override);

    // ── Layer 4: symbol profile (narrowest wins) ────────────────────────
    if let Some(symbol_profile) = scalping.adaptive_regime.symbol_profiles.get(symbol) {
        set.position_multiplier = symbol_profile.position_multiplier;
        let nested = match regime {
            Regime::Trending => symbol_profile.trending.as_ref(),
            Regime::Ranging => symbol_profile.ranging.as_ref(),
            Regime::Choppy => symbol_profile.choppy.as_ref(),
        };
        if let Some(o) = nested {
            apply_override(&mut set, o);
        }
    }

    set
}

fn apply_override(set: &mut ParameterSet, o: &RegimeOverride) {
    if let Some(v) = o.min_score_threshold {
        set.min_score_threshold = v;
    }
    if let Some(v) = o.tp_percent {
        set.tp_percent = v;
    }
    if let Some(v) = o.sl_percent {
        set.sl_percent = v;
    }
    if let Some(v) = o.max_holding_minutes {
        set.max_holding_minutes = v;
    }
    if let Some(v) = o.cooldown_after_loss_minutes {
        set.cooldown_after_loss_minutes = v;
    }
    if let Some(v) = o.indicators.rsi_overbought {
        set.rsi_overbought = v;
    }
    if let Some(v) = o.indicators.rsi_oversold {
        set.rsi_oversold = v;
    }
    if let Some(v) = o.indicators.ema_fast {
        set.ema_fast_period = v;
    }
    if let Some(v) = o.indicators.ema_slow {
        set.ema_slow_period = v;
    }
    if let Some(v) = o.profit_drawdown_multiplier {
        set.profit_drawdown.multiplier = v;
    }
    if let Some(v) = o.partial_tp_trigger_percent {
        set.partial_tp.trigger_percent = v;
    }
    if let Some(v) = o.partial_tp_fraction {
        set.partial_tp.fraction = v;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_overrides() -> EngineConfig {
        serde_json::from_str(
            r#"{
            "scalping": {
                "tp_percent": 2.4,
                "adaptive_regime": {
                    "trending": { "tp_percent": 3.5, "indicators": { "rsi_oversold": 25.0 } },
                    "choppy": { "min_score_threshold": 9.0 },
                    "symbol_profiles": {
                        "BTC-USDT-SWAP": {
                            "position_multiplier": 1.5,
                            "trending": { "tp_percent": 4.0 }
                        }
                    }
                }
            }
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn tier_selection_by_equity() {
        let cfg = EngineConfig::default();
        assert_eq!(BalanceTier::for_equity(&cfg, 100.0), BalanceTier::Micro);
        assert_eq!(BalanceTier::for_equity(&cfg, 500.0), BalanceTier::Small);
        assert_eq!(BalanceTier::for_equity(&cfg, 5_000.0), BalanceTier::Medium);
        assert_eq!(BalanceTier::for_equity(&cfg, 50_000.0), BalanceTier::Large);
    }

    #[test]
    fn global_defaults_flow_through() {
        let resolver = ParameterResolver::new(EngineConfig::default());
        let set = resolver.resolve("SOL-USDT-SWAP", Regime::Ranging, 5_000.0);
        assert!((set.tp_percent - 2.4).abs() < f64::EPSILON);
        assert!((set.partial_tp.fraction - 0.6).abs() < f64::EPSILON);
        assert!((set.position_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn regime_layer_overrides_global() {
        let resolver = ParameterResolver::new(config_with_overrides());
        let set = resolver.resolve("ETH-USDT-SWAP", Regime::Trending, 5_000.0);
        assert!((set.tp_percent - 3.5).abs() < f64::EPSILON);
        assert!((set.rsi_oversold - 25.0).abs() < f64::EPSILON);
        // Choppy raises the score threshold.
        let choppy = resolver.resolve("ETH-USDT-SWAP", Regime::Choppy, 5_000.0);
        assert!((choppy.min_score_threshold - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn symbol_layer_beats_regime_layer() {
        let resolver = ParameterResolver::new(config_with_overrides());
        let set = resolver.resolve("BTC-USDT-SWAP", Regime::Trending, 5_000.0);
        // Symbol profile wins over the regime override.
        assert!((set.tp_percent - 4.0).abs() < f64::EPSILON);
        assert!((set.position_multiplier - 1.5).abs() < f64::EPSILON);
        // Non-overridden field still comes from the regime layer.
        assert!((set.rsi_oversold - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn majors_get_major_big_profit_level() {
        let resolver = ParameterResolver::new(EngineConfig::default());
        let btc = resolver.resolve("BTC-USDT-SWAP", Regime::Ranging, 5_000.0);
        let sol = resolver.resolve("SOL-USDT-SWAP", Regime::Ranging, 5_000.0);
        assert!(btc.profit_harvest.big_profit_exit_percent < sol.profit_harvest.big_profit_exit_percent);
    }

    #[test]
    fn progressive_sizing_interpolates() {
        let cfg = EngineConfig::default();
        let resolver = ParameterResolver::new(cfg);
        // Micro bucket: size_at_min 5 at equity 0, size_at_max 15 at 250.
        let low = resolver.resolve("SOL-USDT-SWAP", Regime::Ranging, 0.0);
        let mid = resolver.resolve("SOL-USDT-SWAP", Regime::Ranging, 125.0);
        assert!((low.base_position_usd - 5.0).abs() < 1e-9);
        assert!((mid.base_position_usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cache_hit_and_invalidation() {
        let resolver = ParameterResolver::new(config_with_overrides());
        let a = resolver.resolve("BTC-USDT-SWAP", Regime::Trending, 5_000.0);
        let b = resolver.resolve("BTC-USDT-SWAP", Regime::Trending, 5_000.0);
        assert!(Arc::ptr_eq(&a, &b), "second resolve should hit the cache");

        resolver.invalidate_symbol("BTC-USDT-SWAP");
        let c = resolver.resolve("BTC-USDT-SWAP", Regime::Trending, 5_000.0);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn reload_publishes_new_snapshot() {
        let resolver = ParameterResolver::new(EngineConfig::default());
        let before = resolver.resolve("ETH-USDT-SWAP", Regime::Ranging, 5_000.0);
        assert!((before.tp_percent - 2.4).abs() < f64::EPSILON);

        let mut updated = EngineConfig::default();
        updated.scalping.tp_percent = 1.0;
        resolver.reload(updated);

        let after = resolver.resolve("ETH-USDT-SWAP", Regime::Ranging, 5_000.0);
        assert!((after.tp_percent - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exit_policy_by_regime_maps_apply() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
            "scalping": {
                "partial_tp": { "by_regime": { "trending": { "trigger_percent": 0.8 } } },
                "profit_drawdown": { "by_regime": { "choppy": { "multiplier": 1.5 } } }
            }
        }"#,
        )
        .unwrap();
        let resolver = ParameterResolver::new(cfg);

        let trending = resolver.resolve("ETH-USDT-SWAP", Regime::Trending, 5_000.0);
        assert!((trending.partial_tp.trigger_percent - 0.8).abs() < f64::EPSILON);

        let choppy = resolver.resolve("ETH-USDT-SWAP", Regime::Choppy, 5_000.0);
        assert!((choppy.profit_drawdown.multiplier - 1.5).abs() < f64::EPSILON);

        // Unnamed regimes keep the base values.
        let ranging = resolver.resolve("ETH-USDT-SWAP", Regime::Ranging, 5_000.0);
        assert!((ranging.partial_tp.trigger_percent - 0.3).abs() < f64::EPSILON);
        assert!((ranging.profit_drawdown.multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn governor_cap_bounds_profile_positions() {
        let mut cfg = EngineConfig::default();
        cfg.risk.max_open_positions = 2;
        let resolver = ParameterResolver::new(cfg);
        let set = resolver.resolve("ETH-USDT-SWAP", Regime::Ranging, 50_000.0);
        // Large profile allows 5 but the risk section caps at 2.
        assert_eq!(set.max_open_positions, 2);
    }
}
