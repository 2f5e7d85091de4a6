// =============================================================================
// OKX REST Client — v5 API with HMAC-SHA256 base64 request signing
// =============================================================================
//
// SECURITY: the secret key and passphrase are never logged or serialised;
// the Debug impl redacts them. Sandbox mode adds the `x-simulated-trading`
// header and must never be combined with production credentials.
//
// Signature: base64(HMAC-SHA256(timestamp + METHOD + path + body)) with an
// ISO-8601 millisecond timestamp, sent via the OK-ACCESS-* headers.
//
// Every response arrives in the `{"code","msg","data"}` envelope; a
// non-zero code is classified into the typed error kinds.
// =============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{classify_okx_code, is_retryable_http_status, EngineError};
use crate::okx::{
    AccountBalance, ExchangePosition, MarginInfo, OrderAck, OrderState, OrderType, TimeInForce,
};
use crate::types::{InstrumentSpec, Side};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";
/// Margin mode used for every order. Cross keeps margin math predictable
/// with the account-level balance the sizer reads.
const MARGIN_MODE: &str = "cross";

pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    sandbox: bool,
    base_url: String,
    client: reqwest::Client,
    /// Fallback leverage ladder when the venue does not enumerate one.
    default_leverage_steps: Vec<u32>,
}

impl OkxClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        sandbox: bool,
        default_leverage_steps: Vec<u32>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(sandbox, "OkxClient initialised (base_url={BASE_URL})");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            sandbox,
            base_url: BASE_URL.to_string(),
            client,
            default_leverage_steps,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// ISO-8601 UTC timestamp with millisecond precision, as OKX expects.
    pub fn timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// base64(HMAC-SHA256(timestamp + method + path + body)).
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> reqwest::RequestBuilder {
        let timestamp = Self::timestamp();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);

        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");

        if self.sandbox {
            builder = builder.header("x-simulated-trading", "1");
        }
        if !body_str.is_empty() {
            builder = builder.body(body_str);
        }
        builder
    }

    /// Send, unwrap the OKX envelope, classify failures.
    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<serde_json::Value, EngineError> {
        let builder = if signed {
            self.signed_request(method, path, body.as_ref())
        } else {
            self.client
                .request(method, format!("{}{}", self.base_url, path))
        };

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("{path}: {e}")))?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(EngineError::RateLimited { retry_after_ms });
        }
        if status == 401 || status == 403 {
            return Err(EngineError::Auth(format!("{path} returned HTTP {status}")));
        }

        let envelope: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(format!("{path}: invalid JSON: {e}")))?;

        if is_retryable_http_status(status) {
            return Err(EngineError::Transport(format!(
                "{path} returned HTTP {status}: {envelope}"
            )));
        }

        parse_envelope(&envelope)
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// GET /api/v5/public/instruments for one SWAP instrument.
    #[instrument(skip(self), name = "okx::get_instrument")]
    pub async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, EngineError> {
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={symbol}");
        let data = self.execute(reqwest::Method::GET, &path, None, false).await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::RejectTerminal {
                code: "instrument_not_found".into(),
                message: format!("no instrument data for {symbol}"),
            })?;

        let max_leverage = field_f64(entry, "lever")? as u32;
        // The venue publishes a maximum but not the discrete ladder; the
        // configured ladder is clamped to it.
        let leverage_steps: Vec<u32> = self
            .default_leverage_steps
            .iter()
            .copied()
            .filter(|&l| l <= max_leverage)
            .collect();

        Ok(InstrumentSpec {
            symbol: symbol.to_string(),
            contract_value: field_f64(entry, "ctVal")?,
            lot_size: field_f64(entry, "lotSz")?,
            tick_size: field_f64(entry, "tickSz")?,
            min_size: field_f64(entry, "minSz")?,
            max_leverage,
            leverage_steps,
        })
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /api/v5/account/balance (signed).
    #[instrument(skip(self), name = "okx::get_balance")]
    pub async fn get_balance(&self) -> Result<AccountBalance, EngineError> {
        let data = self
            .execute(reqwest::Method::GET, "/api/v5/account/balance", None, true)
            .await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty balance response".into()))?;

        Ok(AccountBalance {
            total_equity: field_f64(entry, "totalEq").unwrap_or(0.0),
            available_margin: field_f64(entry, "adjEq").unwrap_or(0.0),
        })
    }

    /// GET /api/v5/account/positions (signed).
    #[instrument(skip(self), name = "okx::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<ExchangePosition>, EngineError> {
        let data = self
            .execute(
                reqwest::Method::GET,
                "/api/v5/account/positions?instType=SWAP",
                None,
                true,
            )
            .await?;

        let rows = data.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::with_capacity(rows.len());

        for row in &rows {
            let contracts_signed = field_f64(row, "pos").unwrap_or(0.0);
            if contracts_signed == 0.0 {
                continue;
            }
            let side = match row["posSide"].as_str() {
                Some("long") => Side::Long,
                Some("short") => Side::Short,
                // Net mode: the sign of `pos` carries the direction.
                _ if contracts_signed < 0.0 => Side::Short,
                _ => Side::Long,
            };

            positions.push(ExchangePosition {
                symbol: row["instId"].as_str().unwrap_or_default().to_string(),
                side,
                contracts: contracts_signed.abs(),
                avg_entry_price: field_f64(row, "avgPx").unwrap_or(0.0),
                leverage: field_f64(row, "lever").unwrap_or(1.0) as u32,
                margin: field_f64(row, "margin").ok().filter(|m| *m > 0.0),
                unrealized_pnl: field_f64(row, "upl").unwrap_or(0.0),
            });
        }

        debug!(count = positions.len(), "exchange positions fetched");
        Ok(positions)
    }

    /// GET /api/v5/account/max-avail-size (signed) — margin headroom for
    /// one instrument.
    #[instrument(skip(self), name = "okx::get_margin_info")]
    pub async fn get_margin_info(&self, symbol: &str) -> Result<MarginInfo, EngineError> {
        let path =
            format!("/api/v5/account/max-avail-size?instId={symbol}&tdMode={MARGIN_MODE}");
        let data = self.execute(reqwest::Method::GET, &path, None, true).await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty margin info response".into()))?;

        Ok(MarginInfo {
            symbol: symbol.to_string(),
            avail_buy: field_f64(entry, "availBuy").unwrap_or(0.0),
            avail_sell: field_f64(entry, "availSell").unwrap_or(0.0),
        })
    }

    /// POST /api/v5/account/set-leverage (signed). Called before every
    /// entry so the venue-side leverage matches the sized order.
    #[instrument(skip(self), name = "okx::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        let body = serde_json::json!({
            "instId": symbol,
            "lever": leverage.to_string(),
            "mgnMode": MARGIN_MODE,
        });
        self.execute(
            reqwest::Method::POST,
            "/api/v5/account/set-leverage",
            Some(body),
            true,
        )
        .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v5/trade/order (signed). OKX encodes IOC/FOK as order
    /// types, so a limit order's time-in-force folds into `ordType`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, price), name = "okx::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        contracts: f64,
        price: Option<f64>,
        reduce_only: bool,
        tif: TimeInForce,
        client_order_id: Option<&str>,
    ) -> Result<OrderAck, EngineError> {
        let ord_type = match (order_type, tif) {
            (OrderType::Limit, TimeInForce::Ioc) => "ioc",
            (OrderType::Limit, TimeInForce::Fok) => "fok",
            _ => order_type.as_okx(),
        };
        let mut body = serde_json::json!({
            "instId": symbol,
            "tdMode": MARGIN_MODE,
            "side": if side.is_long() { "buy" } else { "sell" },
            "ordType": ord_type,
            "sz": contracts.to_string(),
        });
        if let Some(px) = price {
            body["px"] = serde_json::Value::String(px.to_string());
        }
        if reduce_only {
            body["reduceOnly"] = serde_json::Value::Bool(true);
        }
        if let Some(coid) = client_order_id {
            body["clOrdId"] = serde_json::Value::String(coid.to_string());
        }

        let data = self
            .execute(reqwest::Method::POST, "/api/v5/trade/order", Some(body), true)
            .await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty order response".into()))?;

        // Per-order sCode can fail even when the envelope code is 0.
        let s_code = entry["sCode"].as_str().unwrap_or("0");
        if s_code != "0" {
            let msg = entry["sMsg"].as_str().unwrap_or_default();
            warn!(symbol, s_code, msg, "order rejected");
            return Err(classify_okx_code(s_code, msg));
        }

        Ok(OrderAck {
            order_id: entry["ordId"].as_str().unwrap_or_default().to_string(),
            client_order_id: entry["clOrdId"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    /// POST /api/v5/trade/cancel-order (signed).
    #[instrument(skip(self), name = "okx::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "instId": symbol, "ordId": order_id });
        self.execute(
            reqwest::Method::POST,
            "/api/v5/trade/cancel-order",
            Some(body),
            true,
        )
        .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// GET /api/v5/trade/order (signed) — poll an order's fill state.
    #[instrument(skip(self), name = "okx::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderState, EngineError> {
        let path = format!("/api/v5/trade/order?instId={symbol}&ordId={order_id}");
        let data = self.execute(reqwest::Method::GET, &path, None, true).await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty order state response".into()))?;

        Ok(OrderState {
            order_id: order_id.to_string(),
            status: entry["state"].as_str().unwrap_or_default().to_string(),
            filled_contracts: field_f64(entry, "accFillSz").unwrap_or(0.0),
            avg_fill_price: field_f64(entry, "avgPx").unwrap_or(0.0),
        })
    }

    /// POST /api/v5/trade/order-algo (signed) — attach a TP/SL OCO pair to
    /// an open position.
    #[instrument(skip(self), name = "okx::place_oco")]
    pub async fn place_oco(
        &self,
        symbol: &str,
        side: Side,
        contracts: f64,
        tp_price: f64,
        sl_price: f64,
    ) -> Result<OrderAck, EngineError> {
        let body = serde_json::json!({
            "instId": symbol,
            "tdMode": MARGIN_MODE,
            // The OCO closes the position, so it sits on the opposite side.
            "side": if side.is_long() { "sell" } else { "buy" },
            "ordType": "oco",
            "sz": contracts.to_string(),
            "tpTriggerPx": tp_price.to_string(),
            "tpOrdPx": "-1",
            "slTriggerPx": sl_price.to_string(),
            "slOrdPx": "-1",
            "reduceOnly": true,
        });

        let data = self
            .execute(
                reqwest::Method::POST,
                "/api/v5/trade/order-algo",
                Some(body),
                true,
            )
            .await?;

        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty algo order response".into()))?;

        Ok(OrderAck {
            order_id: entry["algoId"].as_str().unwrap_or_default().to_string(),
            client_order_id: None,
        })
    }

    // -------------------------------------------------------------------------
    // Market data (REST fallbacks for the price chain)
    // -------------------------------------------------------------------------

    /// GET /api/v5/public/mark-price — REST mark price fallback.
    #[instrument(skip(self), name = "okx::get_mark_price")]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let path = format!("/api/v5/public/mark-price?instType=SWAP&instId={symbol}");
        let data = self.execute(reqwest::Method::GET, &path, None, false).await?;
        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty mark price response".into()))?;
        field_f64(entry, "markPx")
    }

    /// GET /api/v5/market/ticker — REST last price fallback.
    #[instrument(skip(self), name = "okx::get_last_price")]
    pub async fn get_last_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let path = format!("/api/v5/market/ticker?instId={symbol}");
        let data = self.execute(reqwest::Method::GET, &path, None, false).await?;
        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty ticker response".into()))?;
        field_f64(entry, "last")
    }

    /// GET /api/v5/public/funding-rate (public).
    #[instrument(skip(self), name = "okx::get_funding_rate")]
    pub async fn get_funding_rate(&self, symbol: &str) -> Result<f64, EngineError> {
        let path = format!("/api/v5/public/funding-rate?instId={symbol}");
        let data = self.execute(reqwest::Method::GET, &path, None, false).await?;
        let entry = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Transport("empty funding response".into()))?;
        field_f64(entry, "fundingRate")
    }
}

// ---------------------------------------------------------------------------
// Envelope & field helpers
// ---------------------------------------------------------------------------

/// Unwrap the `{"code","msg","data"}` envelope; classify non-zero codes.
fn parse_envelope(envelope: &serde_json::Value) -> Result<serde_json::Value, EngineError> {
    let code = envelope["code"].as_str().unwrap_or("");
    if code == "0" {
        return Ok(envelope["data"].clone());
    }
    let msg = envelope["msg"].as_str().unwrap_or_default();
    Err(classify_okx_code(code, msg))
}

/// OKX sends numbers as strings; parse one required field.
fn field_f64(entry: &serde_json::Value, name: &str) -> Result<f64, EngineError> {
    match &entry[name] {
        serde_json::Value::String(s) => s.parse::<f64>().map_err(|_| {
            EngineError::Transport(format!("field {name} is not numeric: {s}"))
        }),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EngineError::Transport(format!("field {name} overflow"))),
        _ => Err(EngineError::Transport(format!("missing field {name}"))),
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("sandbox", &self.sandbox)
            .field("base_url", &self.base_url)
            .finish()
    }
}
