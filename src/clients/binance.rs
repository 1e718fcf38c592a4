//! Candle source client
//!
//! Fetches 1m/5m klines for the snapshot worker. Kline rows arrive as
//! positional JSON arrays with string-encoded prices; timestamps are
//! milliseconds and normalised to seconds here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::error::ApiError;
use super::retry::{with_retry, RetryConfig};
use super::CandleSource;
use crate::config::ApiEndpointConfig;
use crate::types::{Candle, CandleInterval};

const MAX_KLINES_PER_REQUEST: i64 = 1000;

/// Candle client over the Binance public API.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl BinanceClient {
    pub fn new(config: &ApiEndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build candle HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::new(config.retries, config.backoff_factor),
        })
    }

    fn symbol_for(asset: &str) -> String {
        format!("{}USDT", asset.to_uppercase())
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Value>, ApiError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", MAX_KLINES_PER_REQUEST.to_string()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::from_network_error(&e))?;

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
}

/// Positional kline row: [openTime, open, high, low, close, volume, ...].
fn parse_kline(row: &Value) -> Option<Candle> {
    let fields = row.as_array()?;
    if fields.len() < 6 {
        return None;
    }
    let t_ms = fields[0].as_i64()?;
    let number = |v: &Value| -> Option<f64> {
        match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    Some(Candle {
        t: t_ms / 1000,
        open: number(&fields[1])?,
        high: number(&fields[2])?,
        low: number(&fields[3])?,
        close: number(&fields[4])?,
        volume: number(&fields[5])?,
    })
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn candles(
        &self,
        asset: &str,
        interval: CandleInterval,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>> {
        let symbol = Self::symbol_for(asset);
        let rows = with_retry(&self.retry, "binance klines", || {
            self.fetch_klines(&symbol, interval.as_str(), from_ts * 1000, to_ts * 1000)
        })
        .await?;

        let candles: Vec<Candle> = rows.iter().filter_map(parse_kline).collect();
        debug!(
            "Fetched {} {} candles for {} in [{}, {}]",
            candles.len(),
            interval.as_str(),
            asset,
            from_ts,
            to_ts
        );
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kline_row_parses_string_prices() {
        let row = json!([
            1_000_000_000_000i64,
            "100.5",
            "101.0",
            "99.5",
            "100.8",
            "12.34",
            1_000_000_059_999i64
        ]);
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.t, 1_000_000_000);
        assert_eq!(candle.open, 100.5);
        assert_eq!(candle.high, 101.0);
        assert_eq!(candle.low, 99.5);
        assert_eq!(candle.close, 100.8);
        assert_eq!(candle.volume, 12.34);
    }

    #[test]
    fn malformed_rows_are_dropped() {
        assert!(parse_kline(&json!(["nope"])).is_none());
        assert!(parse_kline(&json!({"t": 1})).is_none());
        assert!(parse_kline(&json!([1_000_000_000_000i64, "x", "1", "1", "1", "1"])).is_none());
    }

    #[test]
    fn symbol_mapping() {
        assert_eq!(BinanceClient::symbol_for("btc"), "BTCUSDT");
        assert_eq!(BinanceClient::symbol_for("ETH"), "ETHUSDT");
    }
}
