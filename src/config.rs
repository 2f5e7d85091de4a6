// =============================================================================
// Engine Configuration — hot-reloadable layered settings with atomic save
// =============================================================================
//
// Every tunable lives here. Reloads publish a new immutable snapshot via the
// ParameterResolver; readers pick it up on their next cycle — there is no
// globally mutable configuration.
//
// All fields carry `#[serde(default)]` so adding new fields never breaks
// loading an older config file. Persistence uses the atomic tmp + rename
// pattern to prevent corruption on crash.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::regime::RegimeThresholds;
use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT-SWAP".to_string(),
        "ETH-USDT-SWAP".to_string(),
        "SOL-USDT-SWAP".to_string(),
        "XRP-USDT-SWAP".to_string(),
    ]
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_tp_percent() -> f64 {
    2.4
}

fn default_sl_percent() -> f64 {
    1.2
}

fn default_tp_atr_mult() -> f64 {
    2.0
}

fn default_sl_atr_mult() -> f64 {
    1.5
}

fn default_min_score_threshold() -> f64 {
    6.0
}

fn default_min_signal_strength() -> f64 {
    0.40
}

fn default_max_holding_minutes() -> u64 {
    60
}

fn default_cooldown_after_loss_minutes() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_partial_fraction() -> f64 {
    0.6
}

fn default_partial_trigger_percent() -> f64 {
    0.3
}

fn default_partial_min_holding_secs() -> u64 {
    120
}

fn default_drawdown_percent() -> f64 {
    0.20
}

fn default_min_profit_to_activate_usd() -> f64 {
    0.5
}

fn default_harvest_threshold_usd() -> f64 {
    5.0
}

fn default_harvest_time_limit_seconds() -> u64 {
    900
}

fn default_big_profit_majors() -> f64 {
    8.0
}

fn default_big_profit_alts() -> f64 {
    12.0
}

fn default_min_profit_for_extension() -> f64 {
    0.5
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_ema_fast() -> usize {
    9
}

fn default_ema_slow() -> usize {
    21
}

fn default_max_daily_loss_percent() -> f64 {
    5.0
}

fn default_consecutive_losses_limit() -> u32 {
    3
}

fn default_pair_block_duration_min() -> u64 {
    30
}

fn default_max_open_positions() -> u32 {
    3
}

fn default_risk_per_trade_percent() -> f64 {
    2.0
}

fn default_adx_filter_threshold() -> f64 {
    25.0
}

fn default_correlation_limit() -> f64 {
    0.85
}

fn default_correlation_lookback() -> usize {
    50
}

fn default_min_top_notional_usd() -> f64 {
    50_000.0
}

fn default_min_book_depth_usd() -> f64 {
    250_000.0
}

fn default_orderflow_delta_threshold() -> f64 {
    0.15
}

fn default_max_funding_rate() -> f64 {
    0.0005
}

fn default_limit_timeout_secs() -> u64 {
    10
}

fn default_idempotency_ttl_secs() -> u64 {
    30
}

fn default_margin_buffer_percent() -> f64 {
    1.0
}

fn default_kelly_min_trades() -> usize {
    20
}

fn default_journal_dir() -> String {
    "journal".to_string()
}

fn default_freshness_window_secs() -> u64 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_min_position_usd() -> f64 {
    10.0
}

fn default_leverage_steps() -> Vec<u32> {
    vec![1, 2, 3, 5, 10, 20, 50, 75, 100, 125]
}

fn default_position_multiplier() -> f64 {
    1.0
}

// =============================================================================
// Sections
// =============================================================================

/// Per-regime tweak to the partial take-profit policy, keyed by the
/// lower-case regime name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialTpRegimeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
}

/// Partial take-profit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fraction of the position closed at the trigger.
    #[serde(default = "default_partial_fraction")]
    pub fraction: f64,
    /// Margin-basis PnL percent that arms the partial close.
    #[serde(default = "default_partial_trigger_percent")]
    pub trigger_percent: f64,
    /// Base holding-time requirement; adaptive reduction applies at high PnL.
    #[serde(default = "default_partial_min_holding_secs")]
    pub min_holding_secs: u64,
    #[serde(default)]
    pub by_regime: HashMap<String, PartialTpRegimeOverride>,
}

impl Default for PartialTpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fraction: default_partial_fraction(),
            trigger_percent: default_partial_trigger_percent(),
            min_holding_secs: default_partial_min_holding_secs(),
            by_regime: HashMap::new(),
        }
    }
}

/// Per-regime multiplier on the drawdown give-back, keyed by the lower-case
/// regime name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfitDrawdownRegimeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

/// Retrace-from-peak exit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitDrawdownConfig {
    /// Fraction of peak PnL% that may be given back (0.20 = 20%).
    #[serde(default = "default_drawdown_percent")]
    pub drawdown_percent: f64,
    /// Peak profit in USD required before the rule arms.
    #[serde(default = "default_min_profit_to_activate_usd")]
    pub min_profit_to_activate_usd: f64,
    #[serde(default)]
    pub by_regime: HashMap<String, ProfitDrawdownRegimeOverride>,
}

impl Default for ProfitDrawdownConfig {
    fn default() -> Self {
        Self {
            drawdown_percent: default_drawdown_percent(),
            min_profit_to_activate_usd: default_min_profit_to_activate_usd(),
            by_regime: HashMap::new(),
        }
    }
}

/// Trailing-stop policy (margin-basis percentages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// PnL percent at which the trail arms.
    #[serde(default = "default_trailing_activation")]
    pub activation_percent: f64,
    /// Distance the trail keeps below the peak PnL percent.
    #[serde(default = "default_trailing_distance")]
    pub distance_percent: f64,
}

fn default_trailing_activation() -> f64 {
    1.5
}

fn default_trailing_distance() -> f64 {
    0.5
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_percent: default_trailing_activation(),
            distance_percent: default_trailing_distance(),
        }
    }
}

/// Time-bounded USD harvest plus the big-profit percent exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitHarvestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_harvest_threshold_usd")]
    pub threshold_usd: f64,
    #[serde(default = "default_harvest_time_limit_seconds")]
    pub time_limit_seconds: u64,
}

impl Default for ProfitHarvestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_usd: default_harvest_threshold_usd(),
            time_limit_seconds: default_harvest_time_limit_seconds(),
        }
    }
}

/// Indicator thresholds that may be overridden per regime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi_overbought: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi_oversold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_fast: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_slow: Option<usize>,
}

/// Per-regime parameter overrides; `None` fields fall through to the layer
/// below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_holding_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_after_loss_minutes: Option<u64>,
    #[serde(default)]
    pub indicators: IndicatorOverrides,
    /// Multiplier applied to the profit-drawdown percent in this regime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_drawdown_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_tp_trigger_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_tp_fraction: Option<f64>,
}

/// Per-symbol profile: a sizing multiplier plus nested per-regime overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolProfile {
    #[serde(default = "default_position_multiplier")]
    pub position_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trending: Option<RegimeOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranging: Option<RegimeOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choppy: Option<RegimeOverride>,
}

impl Default for SymbolProfile {
    fn default() -> Self {
        Self {
            position_multiplier: 1.0,
            trending: None,
            ranging: None,
            choppy: None,
        }
    }
}

/// Regime-conditioned overrides plus symbol profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRegimeConfig {
    #[serde(default)]
    pub trending: RegimeOverride,
    #[serde(default)]
    pub ranging: RegimeOverride,
    #[serde(default = "default_choppy_override")]
    pub choppy: RegimeOverride,
    #[serde(default)]
    pub symbol_profiles: HashMap<String, SymbolProfile>,
}

/// CHOPPY does not block counter-trend entries; it raises the score bar.
fn default_choppy_override() -> RegimeOverride {
    RegimeOverride {
        min_score_threshold: Some(9.0),
        ..RegimeOverride::default()
    }
}

impl Default for AdaptiveRegimeConfig {
    fn default() -> Self {
        Self {
            trending: RegimeOverride::default(),
            ranging: RegimeOverride::default(),
            choppy: default_choppy_override(),
            symbol_profiles: HashMap::new(),
        }
    }
}

/// One equity-band bucket of the balance-profile ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceProfile {
    /// Upper equity bound (exclusive) for this bucket, USD.
    pub threshold: f64,
    pub base_position_usd: f64,
    pub max_position_usd: f64,
    pub max_open_positions: u32,
    /// When set, base size interpolates between `size_at_min` and
    /// `size_at_max` across the bucket's equity band.
    #[serde(default)]
    pub progressive: bool,
    #[serde(default)]
    pub size_at_min: f64,
    #[serde(default)]
    pub size_at_max: f64,
}

/// The four equity buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceProfiles {
    pub micro: BalanceProfile,
    pub small: BalanceProfile,
    pub medium: BalanceProfile,
    pub large: BalanceProfile,
}

impl Default for BalanceProfiles {
    fn default() -> Self {
        Self {
            micro: BalanceProfile {
                threshold: 250.0,
                base_position_usd: 10.0,
                max_position_usd: 30.0,
                max_open_positions: 2,
                progressive: true,
                size_at_min: 5.0,
                size_at_max: 15.0,
            },
            small: BalanceProfile {
                threshold: 1_000.0,
                base_position_usd: 25.0,
                max_position_usd: 100.0,
                max_open_positions: 3,
                progressive: true,
                size_at_min: 15.0,
                size_at_max: 40.0,
            },
            medium: BalanceProfile {
                threshold: 10_000.0,
                base_position_usd: 100.0,
                max_position_usd: 500.0,
                max_open_positions: 4,
                progressive: false,
                size_at_min: 0.0,
                size_at_max: 0.0,
            },
            large: BalanceProfile {
                threshold: f64::MAX,
                base_position_usd: 500.0,
                max_position_usd: 2_500.0,
                max_open_positions: 5,
                progressive: false,
                size_at_min: 0.0,
                size_at_max: 0.0,
            },
        }
    }
}

/// Scalping strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingConfig {
    /// Decision-scan cadence in seconds.
    #[serde(default = "default_check_interval_secs", alias = "check_interval")]
    pub check_interval_secs: u64,
    /// Base TP / SL, margin-basis percent.
    #[serde(default = "default_tp_percent")]
    pub tp_percent: f64,
    #[serde(default = "default_sl_percent")]
    pub sl_percent: f64,
    #[serde(default = "default_tp_atr_mult")]
    pub tp_atr_mult: f64,
    #[serde(default = "default_sl_atr_mult")]
    pub sl_atr_mult: f64,
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,
    #[serde(default = "default_min_signal_strength")]
    pub min_signal_strength: f64,
    #[serde(default = "default_max_holding_minutes")]
    pub max_holding_minutes: u64,
    #[serde(default = "default_cooldown_after_loss_minutes")]
    pub cooldown_after_loss_minutes: u64,
    #[serde(default)]
    pub partial_tp: PartialTpConfig,
    #[serde(default)]
    pub trailing_stop: TrailingStopConfig,
    #[serde(default)]
    pub profit_drawdown: ProfitDrawdownConfig,
    #[serde(default)]
    pub profit_harvest: ProfitHarvestConfig,
    /// Immediate harvest levels (margin-basis percent) for majors vs alts.
    #[serde(default = "default_big_profit_majors")]
    pub big_profit_exit_percent_majors: f64,
    #[serde(default = "default_big_profit_alts")]
    pub big_profit_exit_percent_alts: f64,
    /// One-time holding extension when the position is in profit.
    #[serde(default)]
    pub extend_time_if_profitable: bool,
    #[serde(default = "default_min_profit_for_extension")]
    pub min_profit_for_extension: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default)]
    pub adaptive_regime: AdaptiveRegimeConfig,
    #[serde(default)]
    pub balance_profiles: BalanceProfiles,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty scalping config deserialises")
    }
}

/// Risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,
    #[serde(default = "default_consecutive_losses_limit")]
    pub consecutive_losses_limit: u32,
    #[serde(default = "default_pair_block_duration_min")]
    pub pair_block_duration_min: u64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_risk_per_trade_percent")]
    pub risk_per_trade_percent: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty risk config deserialises")
    }
}

/// Filter-pipeline thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_adx_filter_threshold")]
    pub adx_threshold: f64,
    #[serde(default = "default_correlation_limit")]
    pub correlation_limit: f64,
    #[serde(default = "default_correlation_lookback")]
    pub correlation_lookback: usize,
    #[serde(default = "default_min_top_notional_usd")]
    pub min_top_notional_usd: f64,
    #[serde(default = "default_min_book_depth_usd")]
    pub min_book_depth_usd: f64,
    #[serde(default = "default_orderflow_delta_threshold")]
    pub orderflow_delta_threshold: f64,
    /// Maximum funding rate (decimal) the entering side may be paying.
    #[serde(default = "default_max_funding_rate")]
    pub max_funding_rate: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty filter config deserialises")
    }
}

/// Order-placement behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds a resting limit order may wait before escalation.
    #[serde(default = "default_limit_timeout_secs")]
    pub limit_timeout_secs: u64,
    /// Escalate an unfilled limit order to market instead of cancelling.
    #[serde(default = "default_true")]
    pub escalate_to_market: bool,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// Free-margin safety buffer applied to the margin check.
    #[serde(default = "default_margin_buffer_percent")]
    pub margin_buffer_percent: f64,
    /// Fallback admissible leverage ladder when the venue omits one.
    #[serde(default = "default_leverage_steps")]
    pub default_leverage_steps: Vec<u32>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty execution config deserialises")
    }
}

/// Kelly-scaling policy for position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Closed trades required per (symbol, regime) before Kelly applies.
    #[serde(default = "default_kelly_min_trades")]
    pub min_trades: usize,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_trades: default_kelly_min_trades(),
        }
    }
}

/// OKX API settings. Credentials come from the environment, never from the
/// config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OkxConfig {
    /// Sandbox (simulated trading). Must never be combined with production
    /// credentials.
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub okx: OkxConfig,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Instrument universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Traded instruments. MUST equal the streaming subscription set.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub scalping: ScalpingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub kelly: KellyConfig,
    #[serde(default)]
    pub regime: RegimeThresholds,
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_min_position_usd")]
    pub min_position_usd: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty engine config deserialises")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.trading.symbols,
            trading_mode = %config.trading_mode,
            sandbox = config.api.okx.sandbox,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Symbols whose big-profit harvest uses the majors level.
    pub fn is_major(symbol: &str) -> bool {
        symbol.starts_with("BTC-") || symbol.starts_with("ETH-")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_full_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.trading.symbols.len(), 4);
        assert!((cfg.scalping.tp_percent - 2.4).abs() < f64::EPSILON);
        assert!((cfg.scalping.partial_tp.fraction - 0.6).abs() < f64::EPSILON);
        assert!((cfg.scalping.profit_drawdown.drawdown_percent - 0.20).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.consecutive_losses_limit, 3);
        assert_eq!(cfg.execution.default_leverage_steps.first(), Some(&1));
        assert!(!cfg.api.okx.sandbox);
        assert_eq!(cfg.reconcile_interval_secs, 60);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "trading": { "symbols": ["ETH-USDT-SWAP"] },
            "scalping": { "tp_percent": 1.8, "adaptive_regime": { "choppy": { "min_score_threshold": 9.0 } } },
            "api": { "okx": { "sandbox": true } }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading.symbols, vec!["ETH-USDT-SWAP"]);
        assert!((cfg.scalping.tp_percent - 1.8).abs() < f64::EPSILON);
        // Untouched fields keep defaults.
        assert!((cfg.scalping.sl_percent - 1.2).abs() < f64::EPSILON);
        assert_eq!(
            cfg.scalping.adaptive_regime.choppy.min_score_threshold,
            Some(9.0)
        );
        assert!(cfg.scalping.adaptive_regime.trending.tp_percent.is_none());
        assert!(cfg.api.okx.sandbox);
    }

    #[test]
    fn symbol_profiles_deserialise() {
        let json = r#"{
            "scalping": { "adaptive_regime": { "symbol_profiles": {
                "BTC-USDT-SWAP": { "position_multiplier": 1.5, "trending": { "tp_percent": 3.0 } }
            } } }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        let profile = &cfg.scalping.adaptive_regime.symbol_profiles["BTC-USDT-SWAP"];
        assert!((profile.position_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(profile.trending.as_ref().unwrap().tp_percent, Some(3.0));
        assert!(profile.ranging.is_none());
    }

    #[test]
    fn balance_profile_ladder_is_ordered() {
        let profiles = BalanceProfiles::default();
        assert!(profiles.micro.threshold < profiles.small.threshold);
        assert!(profiles.small.threshold < profiles.medium.threshold);
        assert!(profiles.medium.threshold < profiles.large.threshold);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading.symbols, back.trading.symbols);
        assert_eq!(cfg.risk.max_open_positions, back.risk.max_open_positions);
        assert!((cfg.scalping.tp_percent - back.scalping.tp_percent).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.trading.symbols = vec!["BTC-USDT-SWAP".to_string()];
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.trading.symbols, vec!["BTC-USDT-SWAP"]);
        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn majors_classification() {
        assert!(EngineConfig::is_major("BTC-USDT-SWAP"));
        assert!(EngineConfig::is_major("ETH-USDT-SWAP"));
        assert!(!EngineConfig::is_major("SOL-USDT-SWAP"));
    }
}
