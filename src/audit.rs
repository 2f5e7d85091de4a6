// =============================================================================
// Decision Audit — record of every trade / no-trade decision
// =============================================================================
//
// Every decision cycle produces one record: either the entry was allowed, or
// the record names the stage that blocked it and why. The engine retains a
// bounded ring of recent records for operator introspection.
// =============================================================================

use serde::Serialize;

/// Auditable outcome of one per-symbol decision cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    /// "long", "short", or "none" when no side was scored.
    pub side: String,
    /// "ALLOW" or "BLOCK".
    pub decision: String,
    /// Stage that blocked the entry (data, indicators, signal, filters,
    /// risk, sizing, execution) when blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    /// ISO 8601 creation time.
    pub created_at: String,
}

impl DecisionRecord {
    pub fn allow(symbol: &str, side: impl Into<String>, score: f64, regime: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: side.into(),
            decision: "ALLOW".to_string(),
            blocking_stage: None,
            reason: None,
            score: Some(score),
            regime: Some(regime.to_string()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn blocked(
        symbol: &str,
        side: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: side.into(),
            decision: "BLOCK".to_string(),
            blocking_stage: Some(stage.into()),
            reason: Some(reason.into()),
            score: None,
            regime: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == "ALLOW"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_and_block_shapes() {
        let allow = DecisionRecord::allow("BTC-USDT-SWAP", "long", 8.5, "TRENDING");
        assert!(allow.is_allowed());
        assert_eq!(allow.score, Some(8.5));
        assert!(allow.blocking_stage.is_none());

        let block = DecisionRecord::blocked("BTC-USDT-SWAP", "long", "filters", "mtf rejected");
        assert!(!block.is_allowed());
        assert_eq!(block.blocking_stage.as_deref(), Some("filters"));
        assert_eq!(block.reason.as_deref(), Some("mtf rejected"));
    }
}
