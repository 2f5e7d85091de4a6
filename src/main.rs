// =============================================================================
// Meridian Perp Scalper — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Switching to Live is
// an explicit configuration change, never a default.
//
// Positions are NOT auto-closed on shutdown: they remain on the exchange
// and reconciliation adopts them on restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod audit;
mod config;
mod error;
mod execution;
mod filters;
mod indicators;
mod journal;
mod market_data;
mod okx;
mod params;
mod position;
mod reconcile;
mod regime;
mod risk;
mod signals;
mod sizing;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::EngineState;
use crate::config::EngineConfig;
use crate::strategy::DecisionEngine;
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Perp Scalper — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // SAFETY: force Demo + Paused on startup.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.trading.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if config.api.okx.sandbox {
        info!("sandbox mode — simulated-trading header enabled on every request");
    }

    info!(symbols = ?config.trading.symbols, "configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(EngineState::new(config)?);
    let symbols = state.resolver.config().trading.symbols.clone();

    // ── 3. Fetch instrument specifications ───────────────────────────────
    for symbol in &symbols {
        match state.client.get_instrument(symbol).await {
            Ok(spec) => {
                info!(
                    symbol,
                    lot_size = spec.lot_size,
                    min_size = spec.min_size,
                    max_leverage = spec.max_leverage,
                    "instrument details loaded"
                );
                state.instruments.write().insert(symbol.clone(), spec);
            }
            Err(e) => {
                warn!(symbol, error = %e, "instrument fetch failed — symbol cannot trade until it succeeds");
            }
        }
    }

    // ── 4. Spawn market data streams ─────────────────────────────────────
    for symbol in &symbols {
        // One candle stream per timeframe.
        for timeframe in market_data::Timeframe::ALL {
            let registry = state.market.clone();
            let sym = symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        market_data::stream::run_candle_stream(&sym, timeframe, &registry).await
                    {
                        error!(symbol = %sym, timeframe = %timeframe, error = %e, "candle stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        // Ticker + mark price stream.
        let registry = state.market.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::stream::run_ticker_stream(&sym, &registry).await {
                    error!(symbol = %sym, error = %e, "ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        // Order book stream.
        let registry = state.market.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::stream::run_book_stream(&sym, &registry).await {
                    error!(symbol = %sym, error = %e, "book stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        // Funding-rate stream.
        let registry = state.market.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::stream::run_funding_stream(&sym, &registry).await {
                    error!(symbol = %sym, error = %e, "funding stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "market data streams launched");

    // ── 5. Decision scan loop ────────────────────────────────────────────
    let scan_state = state.clone();
    let scan_symbols = symbols.clone();
    tokio::spawn(async move {
        // Wait for initial data before the first scan.
        tokio::time::sleep(Duration::from_secs(30)).await;
        info!("decision scan loop starting");

        let interval_secs = scan_state.resolver.config().scalping.check_interval_secs.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            for symbol in &scan_symbols {
                // Per-symbol serialisation: at most one cycle per symbol.
                let lock = scan_state.symbol_lock(symbol);
                let _guard = lock.lock().await;
                DecisionEngine::run_symbol_cycle(&scan_state, symbol).await;
            }
        }
    });

    // ── 6. Reconciliation loop ───────────────────────────────────────────
    let recon_state = state.clone();
    tokio::spawn(async move {
        let interval_secs = recon_state.resolver.config().reconcile_interval_secs.max(5);
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            // Wake on the timer or an integrity-guard request.
            tokio::select! {
                _ = interval.tick() => {}
                _ = recon_state.reconcile_notify.notified() => {
                    info!("reconciliation requested out-of-band");
                }
            }

            if *recon_state.account_mode.read() == AccountMode::Demo {
                continue;
            }

            // Refresh equity alongside the position diff.
            match recon_state.client.get_balance().await {
                Ok(balance) => {
                    *recon_state.account.write() = balance;
                }
                Err(e) => {
                    warn!(error = %e, "balance refresh failed");
                }
            }

            let market = recon_state.market.clone();
            let regimes = recon_state.regimes.clone();
            let report = reconcile::run_cycle(
                &recon_state.client,
                &recon_state.positions,
                |symbol| market.get_tick(symbol).map(|f| f.tick.last),
                |symbol| {
                    regimes
                        .current(symbol)
                        .map(|r| r.regime)
                        .unwrap_or(regime::Regime::Ranging)
                },
            )
            .await;

            match report {
                Some(report) => {
                    for result in &report.results {
                        if let Err(e) = recon_state.journal.append_trade(result) {
                            recon_state
                                .push_error(format!("trade journal write failed: {e}"), None);
                        }
                        recon_state.risk.record_close(
                            &result.symbol,
                            result.net_pnl,
                            chrono::Utc::now().timestamp_millis(),
                        );
                    }
                    *recon_state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                    *recon_state.last_reconcile_error.write() = None;
                    recon_state.increment_version();
                }
                None => {
                    *recon_state.last_reconcile_error.write() =
                        Some("positions fetch failed".to_string());
                }
            }
        }
    });

    // ── 7. Status heartbeat ──────────────────────────────────────────────
    let status_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let snapshot = status_state.snapshot();
            info!(
                version = snapshot.state_version,
                uptime_secs = snapshot.uptime_secs,
                trading_mode = %snapshot.trading_mode,
                open_positions = snapshot.open_positions,
                daily_pnl = format!("{:.2}", snapshot.daily_pnl),
                daily_trades = snapshot.daily_trades,
                daily_loss_halt = snapshot.daily_loss_halt,
                "engine status"
            );
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let mut final_config = (*state.resolver.config()).clone();
    final_config.trading_mode = *state.trading_mode.read();
    final_config.account_mode = *state.account_mode.read();
    if let Err(e) = final_config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    let open = state.positions.open_count();
    if open > 0 {
        warn!(
            open_positions = open,
            "open positions remain on the exchange — reconciliation will adopt them on restart"
        );
    }

    info!("Meridian Perp Scalper shut down complete.");
    Ok(())
}
