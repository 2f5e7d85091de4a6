// =============================================================================
// Typed error kinds for the engine / exchange boundary
// =============================================================================
//
// Propagation policy:
//   - Transport / RateLimited are recovered locally with retries and surfaced
//     only after exhaustion.
//   - Business rejects become structured negative decisions (no trade).
//   - Auth and repeated Invariant violations escalate to an engine-wide halt.
//
// Technical rejects (leverage-change races, temporary exchange conditions)
// must never be counted as a trading loss or arm the per-pair cooldown.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Retryable transport failure (timeout, connection reset, 5xx).
    #[error("transient transport failure: {0}")]
    Transport(String),

    /// Server told us to slow down. Honour the advised delay; never convert
    /// into a trade decision.
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Fatal for the session: halt new entries, attempt graceful
    /// flat-reconciliation.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Temporary exchange condition (e.g. leverage change race). NOT a
    /// trading loss.
    #[error("exchange reject (technical, code {code}): {message}")]
    RejectTechnical { code: String, message: String },

    /// Parameter invalid, instrument not tradable, insufficient margin.
    /// The signal is dropped; no position is created.
    #[error("exchange reject (terminal, code {code}): {message}")]
    RejectTerminal { code: String, message: String },

    /// Feed freshness exceeded the threshold. Blocks new entries for the
    /// symbol; does not block exits.
    #[error("stale market data for {symbol}: age {age_secs}s")]
    StaleData { symbol: String, age_secs: u64 },

    /// Internal model/exchange disagreement. The affected position switches
    /// to HOLD and reconciliation is forced; never a blind emergency close.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether a retry loop may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Whether this error represents an actual losing trade. Technical
    /// conditions must not feed the loss streak or the pair cooldown.
    pub fn counts_as_trading_loss(&self) -> bool {
        false
    }

    /// Whether the whole engine should stop accepting new entries.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

// -----------------------------------------------------------------------------
// OKX error-code classification
// -----------------------------------------------------------------------------

/// Codes that indicate a temporary exchange condition rather than a bad
/// request. Observed around leverage changes and position-mode races.
const TECHNICAL_CODES: &[&str] = &["50013", "50026", "59000", "59001", "59102", "51010"];

/// Codes returned when the API key or signature is rejected.
const AUTH_CODES: &[&str] = &["50111", "50113", "50114", "50102"];

/// Map an OKX `code` / `msg` pair onto a typed error kind.
///
/// Anything unrecognized in the 51xxx range is treated as a terminal
/// parameter/margin reject; unknown codes default to terminal so that a
/// mis-classified error can never open a position.
pub fn classify_okx_code(code: &str, message: &str) -> EngineError {
    if code == "50011" {
        return EngineError::RateLimited {
            retry_after_ms: None,
        };
    }
    if AUTH_CODES.contains(&code) {
        return EngineError::Auth(format!("code {code}: {message}"));
    }
    if TECHNICAL_CODES.contains(&code) {
        return EngineError::RejectTechnical {
            code: code.to_string(),
            message: message.to_string(),
        };
    }
    EngineError::RejectTerminal {
        code: code.to_string(),
        message: message.to_string(),
    }
}

/// Categorize an HTTP status for retry decisions.
pub fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_code_classified() {
        let err = classify_okx_code("50011", "Requests too frequent");
        assert!(matches!(err, EngineError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn leverage_race_is_technical() {
        let err = classify_okx_code("59000", "Setting failed: positions exist");
        assert!(matches!(err, EngineError::RejectTechnical { .. }));
        assert!(!err.counts_as_trading_loss());
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_codes_are_session_fatal() {
        let err = classify_okx_code("50111", "Invalid OK-ACCESS-KEY");
        assert!(matches!(err, EngineError::Auth(_)));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn unknown_code_defaults_terminal() {
        let err = classify_okx_code("51008", "Order amount exceeds balance");
        assert!(matches!(err, EngineError::RejectTerminal { .. }));
        assert!(!err.is_retryable());
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn stale_data_never_retryable() {
        let err = EngineError::StaleData {
            symbol: "BTC-USDT-SWAP".into(),
            age_secs: 12,
        };
        assert!(!err.is_retryable());
        assert!(!err.counts_as_trading_loss());
    }

    #[test]
    fn http_status_retry_table() {
        assert!(is_retryable_http_status(429));
        assert!(is_retryable_http_status(503));
        assert!(!is_retryable_http_status(400));
        assert!(!is_retryable_http_status(404));
    }
}
