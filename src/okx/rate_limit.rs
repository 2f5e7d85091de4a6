// =============================================================================
// Rate-Limit Tracker — windowed counters to stay under OKX API limits
// =============================================================================
//
// OKX enforces per-endpoint limits on 2-second windows. The tracker keeps
// conservative engine-wide counters:
//   - general requests: 20 per 2 s window (hard-capped at 18)
//   - order placements: 60 per 2 s window (hard-capped at 50)
//
// Any thread may consult the pre-flight gates; counters roll over lazily
// when a window expires.
// =============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Window length.
const WINDOW_MS: i64 = 2_000;
/// Self-imposed ceilings below the documented limits.
const REQUEST_CAP_PER_WINDOW: u32 = 18;
const ORDER_CAP_PER_WINDOW: u32 = 50;

struct Window {
    started_ms: i64,
    count: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            started_ms: 0,
            count: 0,
        }
    }

    fn roll(&mut self, now_ms: i64) {
        if now_ms - self.started_ms >= WINDOW_MS {
            self.started_ms = now_ms;
            self.count = 0;
        }
    }
}

/// Immutable snapshot of the current counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub requests_in_window: u32,
    pub orders_in_window: u32,
}

/// Thread-safe windowed rate tracker.
pub struct RateLimitTracker {
    requests: Mutex<Window>,
    orders: Mutex<Window>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Window::new()),
            orders: Mutex::new(Window::new()),
        }
    }

    /// Reserve budget for one request. `false` means the caller must back
    /// off until the window rolls.
    pub fn try_acquire_request(&self, now_ms: i64) -> bool {
        let mut w = self.requests.lock();
        w.roll(now_ms);
        if w.count >= REQUEST_CAP_PER_WINDOW {
            warn!(count = w.count, "request budget exhausted for this window");
            return false;
        }
        w.count += 1;
        true
    }

    /// Reserve budget for one order placement.
    pub fn try_acquire_order(&self, now_ms: i64) -> bool {
        let mut w = self.orders.lock();
        w.roll(now_ms);
        if w.count >= ORDER_CAP_PER_WINDOW {
            warn!(count = w.count, "order budget exhausted for this window");
            return false;
        }
        w.count += 1;
        true
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            requests_in_window: self.requests.lock().count,
            orders_in_window: self.orders.lock().count,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitTracker")
            .field("requests_in_window", &snap.requests_in_window)
            .field("orders_in_window", &snap.orders_in_window)
            .finish()
    }
}
