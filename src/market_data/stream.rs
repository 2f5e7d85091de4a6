// =============================================================================
// OKX Public WebSocket ingest — candles, tickers, order book, funding
// =============================================================================
//
// One connection per (symbol, concern), mirroring the reconnect-loop pattern
// in main.rs: each `run_*_stream` function runs until the stream drops or
// errors, then returns so the caller can sleep and reconnect.
//
// OKX requires an application-level "ping" at least every 30 seconds; every
// stream task sends one on a 20-second interval and ignores the "pong".
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{
    Bar, BarKey, BookTop, FundingSnapshot, MarketDataRegistry, Tick, Timeframe,
};

/// Public channels (tickers, books, funding).
const PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
/// Candle channels live on the business endpoint.
const BUSINESS_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

const PING_INTERVAL_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// Candle stream
// ---------------------------------------------------------------------------

/// Subscribe to the candle channel for one (symbol, timeframe) pair and feed
/// CLOSED bars into the registry. In-progress candles are ignored — the
/// registry only ever sees confirmed bars.
pub async fn run_candle_stream(
    symbol: &str,
    timeframe: Timeframe,
    registry: &Arc<MarketDataRegistry>,
) -> Result<()> {
    let channel = format!("candle{}", timeframe.as_str());
    let sub = subscribe_frame(&channel, symbol);

    info!(symbol, timeframe = %timeframe, "connecting to candle WebSocket");
    let (ws_stream, _resp) = connect_async(BUSINESS_WS_URL)
        .await
        .context("failed to connect to candle WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(sub))
        .await
        .context("failed to send candle subscribe frame")?;

    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write.send(Message::Text("ping".into())).await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "pong" {
                        continue;
                    }
                    match parse_candle_message(&text) {
                        Ok(Some((key, bar))) => {
                            debug!(key = %key, close = bar.close, "closed bar ingested");
                            registry.update_bar(key, bar);
                        }
                        Ok(None) => {} // unconfirmed candle or event ack
                        Err(e) => warn!(error = %e, "failed to parse candle message"),
                    }
                }
                Some(Ok(_)) => {} // binary / ping / pong frames
                Some(Err(e)) => {
                    error!(symbol, error = %e, "candle WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, timeframe = %timeframe, "candle WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ticker + mark-price stream
// ---------------------------------------------------------------------------

/// Subscribe to `tickers` and `mark-price` for one symbol. Ticks are stored
/// on every tickers update — including flat ones, since a flat tick still
/// advances time. The latest mark price is merged in from the mark-price
/// channel.
pub async fn run_ticker_stream(
    symbol: &str,
    registry: &Arc<MarketDataRegistry>,
) -> Result<()> {
    let sub = serde_json::json!({
        "op": "subscribe",
        "args": [
            { "channel": "tickers", "instId": symbol },
            { "channel": "mark-price", "instId": symbol },
        ],
    })
    .to_string();

    info!(symbol, "connecting to ticker WebSocket");
    let (ws_stream, _resp) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to ticker WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(sub))
        .await
        .context("failed to send ticker subscribe frame")?;

    let mut last_mark: Option<f64> = None;
    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write.send(Message::Text("ping".into())).await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "pong" {
                        continue;
                    }
                    match parse_ticker_message(&text, last_mark) {
                        Ok(TickerUpdate::Tick(tick)) => {
                            registry.update_tick(symbol, tick);
                        }
                        Ok(TickerUpdate::Mark(mark)) => {
                            last_mark = Some(mark);
                        }
                        Ok(TickerUpdate::None) => {}
                        Err(e) => warn!(error = %e, "failed to parse ticker message"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol, error = %e, "ticker WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, "ticker WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Order book stream
// ---------------------------------------------------------------------------

/// Subscribe to the `books5` partial-depth channel (top 5 levels) and feed
/// aggregated book tops into the registry.
pub async fn run_book_stream(symbol: &str, registry: &Arc<MarketDataRegistry>) -> Result<()> {
    let sub = subscribe_frame("books5", symbol);

    info!(symbol, "connecting to book WebSocket");
    let (ws_stream, _resp) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to book WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(sub))
        .await
        .context("failed to send book subscribe frame")?;

    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write.send(Message::Text("ping".into())).await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "pong" {
                        continue;
                    }
                    match parse_book_message(symbol, &text) {
                        Ok(Some(book)) => registry.update_book(book),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse book message"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol, error = %e, "book WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, "book WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Funding-rate stream
// ---------------------------------------------------------------------------

/// Subscribe to the `funding-rate` channel and keep the registry's funding
/// snapshot current.
pub async fn run_funding_stream(symbol: &str, registry: &Arc<MarketDataRegistry>) -> Result<()> {
    let sub = subscribe_frame("funding-rate", symbol);

    info!(symbol, "connecting to funding WebSocket");
    let (ws_stream, _resp) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to funding WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(sub))
        .await
        .context("failed to send funding subscribe frame")?;

    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write.send(Message::Text("ping".into())).await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "pong" {
                        continue;
                    }
                    match parse_funding_message(symbol, &text) {
                        Ok(Some(snapshot)) => registry.update_funding(snapshot),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse funding message"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(symbol, error = %e, "funding WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, "funding WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame builders & parsers
// ---------------------------------------------------------------------------

fn subscribe_frame(channel: &str, symbol: &str) -> String {
    serde_json::json!({
        "op": "subscribe",
        "args": [{ "channel": channel, "instId": symbol }],
    })
    .to_string()
}

/// Parse an OKX candle push.
///
/// Expected shape:
/// ```json
/// { "arg": { "channel": "candle1m", "instId": "BTC-USDT-SWAP" },
///   "data": [["1700000000000","37000","37050","36990","37020","123.4","...","...","1"]] }
/// ```
/// The trailing "1" marks a confirmed (closed) candle; "0" candles are
/// still forming and return `Ok(None)`.
fn parse_candle_message(text: &str) -> Result<Option<(BarKey, Bar)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse candle JSON")?;

    // Subscription acks and error events carry an "event" field.
    if root.get("event").is_some() {
        return Ok(None);
    }

    let arg = &root["arg"];
    let channel = arg["channel"].as_str().context("missing arg.channel")?;
    let inst_id = arg["instId"].as_str().context("missing arg.instId")?;

    let tf_str = channel
        .strip_prefix("candle")
        .context("not a candle channel")?;
    let timeframe = Timeframe::parse(tf_str)
        .with_context(|| format!("unsupported candle timeframe: {tf_str}"))?;

    let data = root["data"].as_array().context("missing data array")?;
    let row = match data.first().and_then(|v| v.as_array()) {
        Some(row) => row,
        None => return Ok(None),
    };

    if row.len() < 9 {
        anyhow::bail!("candle row has {} elements, expected >= 9", row.len());
    }

    let confirmed = row[8].as_str() == Some("1");
    if !confirmed {
        return Ok(None);
    }

    let open_time = parse_string_i64(&row[0], "candle ts")?;
    let open = parse_string_f64(&row[1], "candle open")?;
    let high = parse_string_f64(&row[2], "candle high")?;
    let low = parse_string_f64(&row[3], "candle low")?;
    let close = parse_string_f64(&row[4], "candle close")?;
    let volume = parse_string_f64(&row[5], "candle volume")?;

    let bar = Bar {
        open_time,
        close_time: open_time + timeframe.secs() as i64 * 1000,
        open,
        high,
        low,
        close,
        volume,
    };

    Ok(Some((BarKey::new(inst_id, timeframe), bar)))
}

/// Result of parsing a message on the combined tickers/mark-price stream.
#[derive(Debug)]
enum TickerUpdate {
    Tick(Tick),
    Mark(f64),
    None,
}

/// Parse a tickers or mark-price push. `last_mark` is the most recent mark
/// price seen on this connection; it is merged into tickers updates.
fn parse_ticker_message(text: &str, last_mark: Option<f64>) -> Result<TickerUpdate> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    if root.get("event").is_some() {
        return Ok(TickerUpdate::None);
    }

    let channel = root["arg"]["channel"]
        .as_str()
        .context("missing arg.channel")?;
    let data = root["data"].as_array().context("missing data array")?;
    let entry = match data.first() {
        Some(e) => e,
        None => return Ok(TickerUpdate::None),
    };

    match channel {
        "tickers" => {
            let last = parse_string_f64(&entry["last"], "last")?;
            let ts_ms = parse_string_i64(&entry["ts"], "ts")?;
            // Bid/ask may be absent or zero — both mean "unknown".
            let bid = optional_price(&entry["bidPx"]);
            let ask = optional_price(&entry["askPx"]);
            Ok(TickerUpdate::Tick(Tick {
                ts_ms,
                bid,
                ask,
                last,
                mark: last_mark.unwrap_or(last),
            }))
        }
        "mark-price" => {
            let mark = parse_string_f64(&entry["markPx"], "markPx")?;
            Ok(TickerUpdate::Mark(mark))
        }
        other => anyhow::bail!("unexpected channel on ticker stream: {other}"),
    }
}

/// Parse a books5 push into an aggregated [`BookTop`].
fn parse_book_message(symbol: &str, text: &str) -> Result<Option<BookTop>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse book JSON")?;

    if root.get("event").is_some() {
        return Ok(None);
    }

    let data = root["data"].as_array().context("missing data array")?;
    let entry = match data.first() {
        Some(e) => e,
        None => return Ok(None),
    };

    let bids = entry["bids"].as_array().context("missing bids")?;
    let asks = entry["asks"].as_array().context("missing asks")?;
    let ts_ms = parse_string_i64(&entry["ts"], "ts")?;

    let best_bid = level_price(bids.first());
    let best_ask = level_price(asks.first());
    let bid_size = level_size(bids.first());
    let ask_size = level_size(asks.first());
    let bid_depth: f64 = bids.iter().map(|l| level_size(Some(l))).sum();
    let ask_depth: f64 = asks.iter().map(|l| level_size(Some(l))).sum();

    let mid = (best_bid + best_ask) / 2.0;
    let spread_bps = if mid > 0.0 {
        ((best_ask - best_bid) / mid) * 10_000.0
    } else {
        0.0
    };
    let total_depth = bid_depth + ask_depth;
    let imbalance = if total_depth > 0.0 {
        (bid_depth - ask_depth) / total_depth
    } else {
        0.0
    };

    Ok(Some(BookTop {
        symbol: symbol.to_string(),
        best_bid,
        best_ask,
        bid_size,
        ask_size,
        bid_depth,
        ask_depth,
        spread_bps,
        imbalance,
        ts_ms,
    }))
}

/// Parse a funding-rate push.
fn parse_funding_message(symbol: &str, text: &str) -> Result<Option<FundingSnapshot>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse funding JSON")?;

    if root.get("event").is_some() {
        return Ok(None);
    }

    let data = root["data"].as_array().context("missing data array")?;
    let entry = match data.first() {
        Some(e) => e,
        None => return Ok(None),
    };

    let rate = parse_string_f64(&entry["fundingRate"], "fundingRate")?;
    let next_funding_time_ms = parse_string_i64(&entry["nextFundingTime"], "nextFundingTime")?;
    let ts_ms = parse_string_i64(&entry["ts"], "ts").unwrap_or(next_funding_time_ms);

    Ok(Some(FundingSnapshot {
        symbol: symbol.to_string(),
        rate,
        next_funding_time_ms,
        ts_ms,
    }))
}

// OKX sends numeric values as JSON strings.

fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

fn parse_string_i64(val: &serde_json::Value, name: &str) -> Result<i64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as i64: {s}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not a valid i64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// A bid/ask price field that may be absent or "0" (unknown).
fn optional_price(val: &serde_json::Value) -> Option<f64> {
    let px = val.as_str()?.parse::<f64>().ok()?;
    if px > 0.0 {
        Some(px)
    } else {
        None
    }
}

/// Price of a `[px, sz, liqOrders, numOrders]` level.
fn level_price(level: Option<&serde_json::Value>) -> f64 {
    level
        .and_then(|l| l.get(0))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Size of a `[px, sz, liqOrders, numOrders]` level.
fn level_size(level: Option<&serde_json::Value>) -> f64 {
    level
        .and_then(|l| l.get(1))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_confirmed_candle() {
        let json = r#"{
            "arg": { "channel": "candle1m", "instId": "BTC-USDT-SWAP" },
            "data": [["1700000000000","37000.0","37050.0","36990.0","37020.0","123.4","0","0","1"]]
        }"#;
        let (key, bar) = parse_candle_message(json).unwrap().unwrap();
        assert_eq!(key.symbol, "BTC-USDT-SWAP");
        assert_eq!(key.timeframe, Timeframe::M1);
        assert!((bar.close - 37020.0).abs() < f64::EPSILON);
        assert_eq!(bar.close_time, 1700000000000 + 60_000);
    }

    #[test]
    fn unconfirmed_candle_ignored() {
        let json = r#"{
            "arg": { "channel": "candle5m", "instId": "BTC-USDT-SWAP" },
            "data": [["1700000000000","37000","37050","36990","37020","123.4","0","0","0"]]
        }"#;
        assert!(parse_candle_message(json).unwrap().is_none());
    }

    #[test]
    fn subscribe_ack_ignored() {
        let json = r#"{ "event": "subscribe", "arg": { "channel": "candle1m", "instId": "X" } }"#;
        assert!(parse_candle_message(json).unwrap().is_none());
    }

    #[test]
    fn parse_ticker_with_mark_merge() {
        let json = r#"{
            "arg": { "channel": "tickers", "instId": "ETH-USDT-SWAP" },
            "data": [{ "last": "3000.5", "bidPx": "3000.4", "askPx": "3000.6", "ts": "1700000001000" }]
        }"#;
        match parse_ticker_message(json, Some(3001.0)).unwrap() {
            TickerUpdate::Tick(t) => {
                assert!((t.last - 3000.5).abs() < f64::EPSILON);
                assert!((t.mark - 3001.0).abs() < f64::EPSILON);
                assert_eq!(t.bid, Some(3000.4));
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn ticker_missing_bid_is_unknown() {
        let json = r#"{
            "arg": { "channel": "tickers", "instId": "ETH-USDT-SWAP" },
            "data": [{ "last": "3000.5", "bidPx": "0", "ts": "1700000001000" }]
        }"#;
        match parse_ticker_message(json, None).unwrap() {
            TickerUpdate::Tick(t) => {
                assert_eq!(t.bid, None);
                assert_eq!(t.ask, None);
                // No mark seen yet — falls back to last.
                assert!((t.mark - 3000.5).abs() < f64::EPSILON);
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn parse_mark_price_update() {
        let json = r#"{
            "arg": { "channel": "mark-price", "instId": "ETH-USDT-SWAP" },
            "data": [{ "markPx": "2999.9", "ts": "1700000001000" }]
        }"#;
        match parse_ticker_message(json, None).unwrap() {
            TickerUpdate::Mark(m) => assert!((m - 2999.9).abs() < f64::EPSILON),
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[test]
    fn parse_book_aggregates_depth() {
        let json = r#"{
            "arg": { "channel": "books5", "instId": "BTC-USDT-SWAP" },
            "data": [{
                "bids": [["37000.0","2.0","0","1"],["36999.0","3.0","0","1"]],
                "asks": [["37001.0","1.0","0","1"],["37002.0","2.0","0","1"]],
                "ts": "1700000002000"
            }]
        }"#;
        let book = parse_book_message("BTC-USDT-SWAP", json).unwrap().unwrap();
        assert!((book.best_bid - 37000.0).abs() < f64::EPSILON);
        assert!((book.best_ask - 37001.0).abs() < f64::EPSILON);
        assert!((book.bid_depth - 5.0).abs() < f64::EPSILON);
        assert!((book.ask_depth - 3.0).abs() < f64::EPSILON);
        // (5 - 3) / 8 = 0.25
        assert!((book.imbalance - 0.25).abs() < 1e-12);
        assert!(book.spread_bps > 0.0);
    }

    #[test]
    fn parse_funding_snapshot() {
        let json = r#"{
            "arg": { "channel": "funding-rate", "instId": "BTC-USDT-SWAP" },
            "data": [{ "fundingRate": "0.0001", "nextFundingTime": "1700003600000", "ts": "1700000000000" }]
        }"#;
        let snap = parse_funding_message("BTC-USDT-SWAP", json)
            .unwrap()
            .unwrap();
        assert!((snap.rate - 0.0001).abs() < 1e-12);
        assert_eq!(snap.next_funding_time_ms, 1700003600000);
    }
}
