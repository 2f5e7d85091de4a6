// =============================================================================
// OKX Exchange Adapter
// =============================================================================
//
// REST client with OKX v5 request signing plus the rate-limit tracker. The
// engine core only ever sees the typed capability surface exposed here;
// errors cross the boundary as the typed kinds in `crate::error`.

pub mod client;
pub mod rate_limit;

use serde::{Deserialize, Serialize};

use crate::types::Side;

pub use client::OkxClient;
pub use rate_limit::RateLimitTracker;

/// Account equity and margin headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Total account equity, USD.
    pub total_equity: f64,
    /// Margin available for new positions, USD.
    pub available_margin: f64,
}

/// A position as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Contracts, always positive.
    pub contracts: f64,
    pub avg_entry_price: f64,
    pub leverage: u32,
    /// Margin the venue reports for the position, if any.
    pub margin: Option<f64>,
    pub unrealized_pnl: f64,
}

/// Margin headroom for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginInfo {
    pub symbol: String,
    /// Contracts available to open on the buy side.
    pub avail_buy: f64,
    /// Contracts available to open on the sell side.
    pub avail_sell: f64,
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
}

/// Live state of an order being polled for fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    /// "live", "partially_filled", "filled", "canceled".
    pub status: String,
    pub filled_contracts: f64,
    pub avg_fill_price: f64,
}

impl OrderState {
    pub fn is_filled(&self) -> bool {
        self.status == "filled"
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "live" | "partially_filled")
    }
}

/// Order types the executor places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    PostOnly,
}

impl OrderType {
    pub fn as_okx(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::PostOnly => "post_only",
        }
    }
}

/// Time-in-force for the order journal. OKX encodes TIF in the order type;
/// the journal still records the requested discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtd,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
            Self::Gtd => write!(f, "GTD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_state_predicates() {
        let live = OrderState {
            order_id: "1".into(),
            status: "partially_filled".into(),
            filled_contracts: 1.0,
            avg_fill_price: 100.0,
        };
        assert!(live.is_live());
        assert!(!live.is_filled());

        let done = OrderState {
            status: "filled".into(),
            ..live
        };
        assert!(done.is_filled());
        assert!(!done.is_live());
    }

    #[test]
    fn order_type_wire_names() {
        assert_eq!(OrderType::Market.as_okx(), "market");
        assert_eq!(OrderType::PostOnly.as_okx(), "post_only");
    }
}
