//! Order-book client
//!
//! Price history for CAP validation plus the live order surface. Live calls
//! authenticate with HMAC API-key headers; credentials come from the
//! environment and are never logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use super::error::ApiError;
use super::retry::{with_retry, RetryConfig};
use super::{BookClient, LimitOrder, OrderState, OrderStatus};
use crate::config::ApiEndpointConfig;
use crate::types::PriceTick;

type HmacSha256 = Hmac<Sha256>;

/// API-key credentials for the order surface. History endpoints are public.
#[derive(Clone)]
pub struct ApiCredentials {
    api_key: String,
    api_secret: String,
    passphrase: String,
}

impl ApiCredentials {
    /// Read POLYMARKET_API_KEY / POLYMARKET_API_SECRET /
    /// POLYMARKET_PASSPHRASE; absent or partial credentials yield None.
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("POLYMARKET_API_KEY").ok().filter(|v| !v.is_empty())?;
        let api_secret = env::var("POLYMARKET_API_SECRET")
            .ok()
            .filter(|v| !v.is_empty())?;
        let passphrase = env::var("POLYMARKET_PASSPHRASE")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self {
            api_key,
            api_secret,
            passphrase,
        })
    }

    /// Hex HMAC-SHA256 over `timestamp + method + path + body`.
    fn sign(&self, method: &str, path: &str, body: &str, timestamp: i64) -> String {
        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn headers(&self, method: &str, path: &str, body: &str) -> Vec<(String, String)> {
        let timestamp = chrono::Utc::now().timestamp();
        vec![
            ("POLY_API_KEY".to_string(), self.api_key.clone()),
            (
                "POLY_SIGNATURE".to_string(),
                self.sign(method, path, body, timestamp),
            ),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), self.passphrase.clone()),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct PricePoint {
    #[serde(alias = "timestamp", alias = "ts")]
    t: Option<i64>,
    #[serde(alias = "price")]
    p: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(alias = "orderID", alias = "id")]
    order_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "filledPrice", alias = "fill_price")]
    filled_price: Option<Value>,
}

/// Book client over the CLOB API.
pub struct ClobClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    credentials: Option<ApiCredentials>,
}

impl ClobClient {
    pub fn new(config: &ApiEndpointConfig, credentials: Option<ApiCredentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build book HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::new(config.retries, config.backoff_factor),
            credentials,
        })
    }

    fn credentials(&self) -> Result<&ApiCredentials> {
        self.credentials
            .as_ref()
            .context("live order placement requires POLYMARKET_API_KEY/SECRET/PASSPHRASE")
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| ApiError::from_network_error(&e))?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::from_response(status.as_u16(), &body, retry_after));
    }
    response
        .json()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

fn decimal_from(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

/// Normalise a history payload (bare list or `{"history": [...]}`) into
/// ascending ticks. Duplicate timestamps keep their arrival order.
fn normalize_ticks(raw: Value) -> Vec<PriceTick> {
    let points: Vec<PricePoint> = match raw {
        Value::Array(_) => serde_json::from_value(raw).unwrap_or_default(),
        Value::Object(ref map) => map
            .get("history")
            .cloned()
            .and_then(|h| serde_json::from_value(h).ok())
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut ticks: Vec<PriceTick> = points
        .into_iter()
        .filter_map(|point| {
            let ts = point.t?;
            let ts = if ts > 1_000_000_000_000 { ts / 1000 } else { ts };
            let price = decimal_from(&point.p?)?;
            Some(PriceTick { ts, price })
        })
        .collect();

    ticks.sort_by_key(|tick| tick.ts);
    ticks
}

#[async_trait]
impl BookClient for ClobClient {
    async fn price_ticks(
        &self,
        token_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<PriceTick>> {
        let params = [
            ("market", token_id.to_string()),
            ("startTs", from_ts.to_string()),
            ("endTs", to_ts.to_string()),
        ];
        let raw = with_retry(&self.retry, "clob prices", || {
            self.get_json("/prices-history", &params)
        })
        .await?;

        let ticks = normalize_ticks(raw);
        debug!(
            "Fetched {} ticks for {}... in [{}, {}]",
            ticks.len(),
            &token_id[..token_id.len().min(16)],
            from_ts,
            to_ts
        );
        Ok(ticks)
    }

    async fn place_limit(&self, order: &LimitOrder) -> Result<String> {
        let credentials = self.credentials()?;
        let path = "/order";
        let body = json!({
            "tokenID": order.token_id,
            "side": "BUY",
            "price": order.price.to_string(),
            "size": order.size.to_string(),
            "orderType": "GTC",
        })
        .to_string();

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).body(body.clone());
        for (name, value) in credentials.headers("POST", path, &body) {
            request = request.header(name, value);
        }
        request = request.header("Content-Type", "application/json");

        let raw = read_json(request.send().await.map_err(|e| ApiError::from_network_error(&e))?)
            .await?;
        let response: OrderResponse =
            serde_json::from_value(raw).context("unexpected order response shape")?;

        if let Some(error) = response.error {
            anyhow::bail!("order rejected by venue: {}", error);
        }
        let order_id = response.order_id.context("order response missing id")?;
        info!(
            "Limit order {} placed on {}... at {}",
            order_id,
            &order.token_id[..order.token_id.len().min(16)],
            order.price
        );
        Ok(order_id)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderState> {
        let credentials = self.credentials()?;
        let path = format!("/order/{}", order_id);

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url);
        for (name, value) in credentials.headers("GET", &path, "") {
            request = request.header(name, value);
        }

        let raw = read_json(request.send().await.map_err(|e| ApiError::from_network_error(&e))?)
            .await?;
        let response: OrderStatusResponse =
            serde_json::from_value(raw).context("unexpected order status shape")?;

        let status = match response
            .status
            .as_deref()
            .unwrap_or("live")
            .to_lowercase()
            .as_str()
        {
            "matched" | "filled" => OrderStatus::Filled,
            "partial" | "partially_filled" => OrderStatus::Partial,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "expired" => OrderStatus::Expired,
            _ => OrderStatus::Live,
        };

        Ok(OrderState {
            status,
            fill_price: response.filled_price.as_ref().and_then(decimal_from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn history_normalises_wrapped_and_bare_lists() {
        let wrapped = json!({"history": [
            {"t": 1_000_000, "p": "0.52"},
            {"t": 1_000_010, "p": 0.54}
        ]});
        let ticks = normalize_ticks(wrapped);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].price, dec!(0.52));

        let bare = json!([{"t": 5, "p": "0.40"}]);
        assert_eq!(normalize_ticks(bare).len(), 1);
    }

    #[test]
    fn history_sorts_ascending_and_normalises_ms() {
        let raw = json!([
            {"t": 1_000_020_000i64, "p": "0.50"},
            {"t": 1_000_010, "p": "0.60"}
        ]);
        let ticks = normalize_ticks(raw);
        // 1_000_020_000 is below the ms cutoff so it stays in seconds and
        // sorts after the earlier tick.
        assert_eq!(ticks[0].ts, 1_000_010);
        assert_eq!(ticks[1].ts, 1_000_020_000);

        let raw_ms = json!([{"t": 1_700_000_000_123i64, "p": "0.50"}]);
        assert_eq!(normalize_ticks(raw_ms)[0].ts, 1_700_000_000);
    }

    #[test]
    fn malformed_points_are_dropped() {
        let raw = json!([{"p": "0.5"}, {"t": 10}, {"t": 11, "p": "0.4"}]);
        let ticks = normalize_ticks(raw);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].ts, 11);
    }

    #[test]
    fn signature_is_deterministic() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            passphrase: "pass".into(),
        };
        let a = creds.sign("POST", "/order", "{}", 1_000_000);
        let b = creds.sign("POST", "/order", "{}", 1_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, creds.sign("POST", "/order", "{}", 1_000_001));
    }
}
