// =============================================================================
// MarketDataRegistry — authoritative, thread-safe view of live market state
// =============================================================================
//
// The single cache every downstream component reads from. Guarantees:
//   - Monotonic timestamps per feed (out-of-order updates are dropped).
//   - Bars are ingested only once closed; duplicate bars (same close
//     timestamp, same close, zero volume) are dropped as transport artifacts.
//   - `get_tick` surfaces a staleness flag once the feed exceeds the
//     freshness window. Stale data vetoes new entries but exits are still
//     serviced from it.
//
// Flat ticks (unchanged price) are NEVER deduplicated: a flat tick still
// advances time and must refresh indicators and trigger exit checks.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::market_data::{Bar, BarKey, BookTop, FundingSnapshot, Tick, Timeframe};

/// Default number of closed bars retained per (symbol, timeframe). Must
/// exceed the longest indicator lookback (ADX needs 2*period+1).
const DEFAULT_MAX_BARS: usize = 500;

/// A tick together with its freshness verdict.
#[derive(Debug, Clone)]
pub struct FreshTick {
    pub tick: Tick,
    /// True when the feed has exceeded the freshness window. Consumers must
    /// treat this as a veto on new entries.
    pub stale: bool,
    pub age_secs: u64,
}

/// Thread-safe registry of per-symbol ticks, bar rings, book tops and
/// funding rates. Multiple readers, single writer per feed.
pub struct MarketDataRegistry {
    ticks: RwLock<HashMap<String, Tick>>,
    bars: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    books: RwLock<HashMap<String, BookTop>>,
    funding: RwLock<HashMap<String, FundingSnapshot>>,
    max_bars: usize,
    freshness_window_secs: u64,
}

impl MarketDataRegistry {
    pub fn new(freshness_window_secs: u64) -> Self {
        Self {
            ticks: RwLock::new(HashMap::new()),
            bars: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            funding: RwLock::new(HashMap::new()),
            max_bars: DEFAULT_MAX_BARS,
            freshness_window_secs,
        }
    }

    pub fn with_max_bars(mut self, max_bars: usize) -> Self {
        self.max_bars = max_bars;
        self
    }

    // -------------------------------------------------------------------------
    // Tick feed
    // -------------------------------------------------------------------------

    /// Store the latest tick for `symbol`. Updates with a timestamp older
    /// than the stored one are dropped; equal-price ticks are kept (time
    /// still advances).
    pub fn update_tick(&self, symbol: &str, tick: Tick) {
        let mut ticks = self.ticks.write();
        if let Some(existing) = ticks.get(symbol) {
            if tick.ts_ms < existing.ts_ms {
                warn!(
                    symbol,
                    incoming_ts = tick.ts_ms,
                    stored_ts = existing.ts_ms,
                    "out-of-order tick dropped"
                );
                return;
            }
        }
        ticks.insert(symbol.to_string(), tick);
    }

    /// Latest tick plus staleness verdict, judged against the wall clock.
    pub fn get_tick(&self, symbol: &str) -> Option<FreshTick> {
        self.get_tick_at(symbol, Utc::now().timestamp_millis())
    }

    /// Staleness-aware read against an explicit `now` (testable).
    pub fn get_tick_at(&self, symbol: &str, now_ms: i64) -> Option<FreshTick> {
        let ticks = self.ticks.read();
        let tick = ticks.get(symbol)?.clone();
        let age_ms = now_ms.saturating_sub(tick.ts_ms).max(0);
        let age_secs = (age_ms / 1000) as u64;
        let stale = age_secs > self.freshness_window_secs;
        if stale {
            debug!(symbol, age_secs, "tick feed stale");
        }
        Some(FreshTick {
            tick,
            stale,
            age_secs,
        })
    }

    // -------------------------------------------------------------------------
    // Bar feed
    // -------------------------------------------------------------------------

    /// Append a closed bar. Duplicates and out-of-order bars are dropped;
    /// the ring is trimmed to the retention budget.
    pub fn update_bar(&self, key: BarKey, bar: Bar) {
        let mut map = self.bars.write();
        let ring = map
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some(last) = ring.back() {
            if bar.close_time == last.close_time
                && (bar.close - last.close).abs() < f64::EPSILON
                && bar.volume == 0.0
            {
                debug!(key = %key, close_time = bar.close_time, "duplicate bar artifact dropped");
                return;
            }
            if bar.close_time <= last.close_time {
                warn!(
                    key = %key,
                    incoming = bar.close_time,
                    stored = last.close_time,
                    "non-monotonic bar dropped"
                );
                return;
            }
        }

        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// The most recent `count` closed bars (oldest-first order).
    pub fn get_bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Bar> {
        let key = BarKey::new(symbol, timeframe);
        let map = self.bars.read();
        match map.get(&key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The most recent `count` close prices (oldest-first order).
    pub fn get_closes(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<f64> {
        self.get_bars(symbol, timeframe, count)
            .iter()
            .map(|b| b.close)
            .collect()
    }

    /// Close price of the most recent closed bar.
    pub fn last_close(&self, symbol: &str, timeframe: Timeframe) -> Option<f64> {
        let key = BarKey::new(symbol, timeframe);
        let map = self.bars.read();
        map.get(&key).and_then(|ring| ring.back().map(|b| b.close))
    }

    /// Number of closed bars stored for a key.
    pub fn bar_count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        let key = BarKey::new(symbol, timeframe);
        self.bars.read().get(&key).map_or(0, VecDeque::len)
    }

    // -------------------------------------------------------------------------
    // Book feed
    // -------------------------------------------------------------------------

    pub fn update_book(&self, book: BookTop) {
        let mut books = self.books.write();
        if let Some(existing) = books.get(&book.symbol) {
            if book.ts_ms < existing.ts_ms {
                return;
            }
        }
        books.insert(book.symbol.clone(), book);
    }

    pub fn get_book(&self, symbol: &str) -> Option<BookTop> {
        self.books.read().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Funding feed
    // -------------------------------------------------------------------------

    pub fn update_funding(&self, snapshot: FundingSnapshot) {
        self.funding
            .write()
            .insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get_funding(&self, symbol: &str) -> Option<FundingSnapshot> {
        self.funding.read().get(symbol).cloned()
    }
}

impl std::fmt::Debug for MarketDataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataRegistry")
            .field("symbols_with_ticks", &self.ticks.read().len())
            .field("bar_series", &self.bars.read().len())
            .field("freshness_window_secs", &self.freshness_window_secs)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, last: f64) -> Tick {
        Tick {
            ts_ms,
            bid: Some(last - 0.5),
            ask: Some(last + 0.5),
            last,
            mark: last,
        }
    }

    fn bar(close_time: i64, close: f64, volume: f64) -> Bar {
        Bar {
            open_time: close_time - 60_000,
            close_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    #[test]
    fn out_of_order_tick_dropped() {
        let reg = MarketDataRegistry::new(10);
        reg.update_tick("BTC-USDT-SWAP", tick(2000, 100.0));
        reg.update_tick("BTC-USDT-SWAP", tick(1000, 99.0));
        let fresh = reg.get_tick_at("BTC-USDT-SWAP", 2000).unwrap();
        assert!((fresh.tick.last - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flat_tick_still_advances_time() {
        let reg = MarketDataRegistry::new(10);
        reg.update_tick("BTC-USDT-SWAP", tick(1000, 100.0));
        // Same price, newer timestamp: must replace, not dedupe.
        reg.update_tick("BTC-USDT-SWAP", tick(5000, 100.0));
        let fresh = reg.get_tick_at("BTC-USDT-SWAP", 5000).unwrap();
        assert_eq!(fresh.tick.ts_ms, 5000);
    }

    #[test]
    fn staleness_flag_past_window() {
        let reg = MarketDataRegistry::new(10);
        reg.update_tick("ETH-USDT-SWAP", tick(0, 3000.0));

        let fresh = reg.get_tick_at("ETH-USDT-SWAP", 9_000).unwrap();
        assert!(!fresh.stale);

        let stale = reg.get_tick_at("ETH-USDT-SWAP", 11_000).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.age_secs, 11);
    }

    #[test]
    fn duplicate_bar_artifact_dropped() {
        let reg = MarketDataRegistry::new(10);
        let key = BarKey::new("BTC-USDT-SWAP", Timeframe::M1);
        reg.update_bar(key.clone(), bar(60_000, 100.0, 12.0));
        // Transport artifact: same close ts, same close, zero volume.
        reg.update_bar(key.clone(), bar(60_000, 100.0, 0.0));
        assert_eq!(reg.bar_count("BTC-USDT-SWAP", Timeframe::M1), 1);
    }

    #[test]
    fn non_monotonic_bar_dropped() {
        let reg = MarketDataRegistry::new(10);
        let key = BarKey::new("BTC-USDT-SWAP", Timeframe::M1);
        reg.update_bar(key.clone(), bar(120_000, 101.0, 5.0));
        reg.update_bar(key.clone(), bar(60_000, 100.0, 5.0));
        let bars = reg.get_bars("BTC-USDT-SWAP", Timeframe::M1, 10);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close_time, 120_000);
    }

    #[test]
    fn ring_trims_to_budget() {
        let reg = MarketDataRegistry::new(10).with_max_bars(3);
        let key = BarKey::new("SOL-USDT-SWAP", Timeframe::M5);
        for i in 1..=5 {
            reg.update_bar(key.clone(), bar(i * 300_000, 100.0 + i as f64, 1.0));
        }
        let closes = reg.get_closes("SOL-USDT-SWAP", Timeframe::M5, 10);
        assert_eq!(closes, vec![103.0, 104.0, 105.0]);
        assert_eq!(reg.last_close("SOL-USDT-SWAP", Timeframe::M5), Some(105.0));
    }

    #[test]
    fn book_update_monotonic() {
        let reg = MarketDataRegistry::new(10);
        reg.update_book(BookTop {
            symbol: "BTC-USDT-SWAP".into(),
            best_bid: 100.0,
            best_ask: 100.1,
            bid_size: 2.0,
            ask_size: 2.0,
            bid_depth: 10.0,
            ask_depth: 8.0,
            spread_bps: 1.0,
            imbalance: 0.11,
            ts_ms: 2000,
        });
        reg.update_book(BookTop {
            symbol: "BTC-USDT-SWAP".into(),
            best_bid: 99.0,
            best_ask: 99.1,
            bid_size: 2.0,
            ask_size: 2.0,
            bid_depth: 10.0,
            ask_depth: 8.0,
            spread_bps: 1.0,
            imbalance: 0.11,
            ts_ms: 1000,
        });
        let book = reg.get_book("BTC-USDT-SWAP").unwrap();
        assert!((book.best_bid - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_reads_return_none() {
        let reg = MarketDataRegistry::new(10);
        assert!(reg.get_tick_at("NOPE", 0).is_none());
        assert!(reg.get_book("NOPE").is_none());
        assert!(reg.get_funding("NOPE").is_none());
        assert!(reg.get_bars("NOPE", Timeframe::M1, 5).is_empty());
    }
}
