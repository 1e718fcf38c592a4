//! Market catalog client
//!
//! Discovers hourly "up or down" windows and resolves settled outcomes.
//! The catalog returns events with nested markets; filtering happens at the
//! market level, with token ids and timestamps pulled from whichever of the
//! known field shapes the API used for that market.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::retry::{with_retry, RetryConfig};
use super::{DiscoveredWindow, MarketCatalog};
use crate::config::ApiEndpointConfig;
use crate::types::{Direction, MarketWindow};

/// Markets whose end is this far behind `now` are still reported, so a
/// window that just closed can settle.
const GRACE_PERIOD_SECONDS: i64 = 300;
/// How far ahead discovery looks.
const FORWARD_HORIZON_SECONDS: i64 = 7200;

const UP_OR_DOWN_PATTERNS: &[&str] = &["up or down", "up/down", "updown"];

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    events: Vec<GammaEvent>,
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaEvent {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    start_date: Option<Value>,
    #[serde(default)]
    end_date: Option<Value>,
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default)]
    start_date: Option<Value>,
    #[serde(default)]
    end_date: Option<Value>,
    #[serde(default)]
    close_time: Option<Value>,
    /// JSON-encoded list like "[\"Up\", \"Down\"]"
    #[serde(default)]
    outcomes: Option<Value>,
    /// JSON-encoded list of token ids, parallel to `outcomes`
    #[serde(default)]
    clob_token_ids: Option<Value>,
    #[serde(default)]
    tokens: Vec<GammaToken>,
    /// JSON-encoded list like "[\"1\", \"0\"]" once resolved
    #[serde(default)]
    outcome_prices: Option<Value>,
    #[serde(default)]
    resolved: Option<bool>,
    #[serde(default)]
    uma_resolution_status: Option<String>,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct GammaToken {
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default, alias = "tokenId")]
    token_id: Option<String>,
}

/// Catalog client over the Gamma API.
pub struct GammaClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl GammaClient {
    pub fn new(config: &ApiEndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::new(config.retries, config.backoff_factor),
        })
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

    async fn search(&self, query: &str, recurrence: Option<&str>) -> Result<Vec<GammaMarket>> {
        let mut params = vec![
            ("q", query.to_string()),
            ("keep_closed_markets", "1".to_string()),
            ("limit_per_type", "100".to_string()),
            ("sort", "endDate".to_string()),
            ("ascending", "false".to_string()),
        ];
        if let Some(recurrence) = recurrence {
            params.push(("recurrence", recurrence.to_string()));
        }

        let raw = with_retry(&self.retry, "gamma search", || {
            self.get_json("/public-search", &params)
        })
        .await?;
        let response: SearchResponse =
            serde_json::from_value(raw).context("unexpected catalog search response shape")?;

        // Flatten event-nested markets, carrying event timestamps as
        // fallbacks for markets that omit their own.
        let mut markets = response.markets;
        for event in response.events {
            for mut market in event.markets {
                if market.end_date.is_none() {
                    market.end_date = event.end_date.clone();
                }
                if market.start_date.is_none() {
                    market.start_date = event.start_date.clone();
                }
                if market.title.is_none() {
                    market.title = event.title.clone();
                }
                markets.push(market);
            }
        }
        Ok(markets)
    }

    fn parse_window(market: &GammaMarket, asset: &str) -> Option<DiscoveredWindow> {
        let slug = market.slug.clone()?;
        let end_ts = market
            .end_date
            .as_ref()
            .and_then(parse_timestamp)
            .or_else(|| market.close_time.as_ref().and_then(parse_timestamp))?;
        let start_ts = market
            .start_date
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or(end_ts - 3600);

        let (up_token_id, down_token_id) = extract_token_ids(market)?;

        Some(DiscoveredWindow {
            asset: asset.to_string(),
            slug,
            condition_id: market.condition_id.clone().unwrap_or_default(),
            up_token_id,
            down_token_id,
            start_ts,
            end_ts,
        })
    }
}

#[async_trait]
impl MarketCatalog for GammaClient {
    async fn list_open_windows(
        &self,
        assets: &[String],
        now: i64,
    ) -> Result<Vec<DiscoveredWindow>> {
        let mut windows: Vec<DiscoveredWindow> = Vec::new();

        for asset in assets {
            let asset_upper = asset.to_uppercase();
            let queries = discovery_queries(&asset_upper);

            let mut found_for_asset = false;
            for query in &queries {
                // Prefer the hourly recurrence filter, fall back to a bare
                // search when the venue returns nothing for it.
                let mut markets = self.search(query, Some("hourly")).await.unwrap_or_default();
                if markets.is_empty() {
                    markets = match self.search(query, None).await {
                        Ok(markets) => markets,
                        Err(e) => {
                            warn!("Catalog search failed for {}: {:#}", query, e);
                            continue;
                        }
                    };
                }

                for market in &markets {
                    let text = market_text(market);
                    if !matches_asset(&text, &asset_upper) || !is_up_or_down(&text) {
                        continue;
                    }
                    let Some(window) = Self::parse_window(market, &asset_upper) else {
                        debug!(
                            "Skipping market without tokens/timestamps: {}",
                            market.slug.as_deref().unwrap_or("?")
                        );
                        continue;
                    };
                    if window.end_ts < now - GRACE_PERIOD_SECONDS
                        || window.end_ts > now + FORWARD_HORIZON_SECONDS
                    {
                        continue;
                    }
                    if windows.iter().any(|w| w.slug == window.slug) {
                        continue;
                    }
                    info!(
                        "Discovered window {} ({}, ends in {}s)",
                        window.slug,
                        window.asset,
                        window.end_ts - now
                    );
                    windows.push(window);
                    found_for_asset = true;
                }

                if found_for_asset {
                    break;
                }
            }
        }

        Ok(windows)
    }

    async fn resolved_outcome(&self, window: &MarketWindow) -> Result<Option<Direction>> {
        let params = [("slug", window.slug.clone())];
        let raw = with_retry(&self.retry, "gamma market", || {
            self.get_json("/markets", &params)
        })
        .await?;

        let markets: Vec<GammaMarket> = match raw {
            Value::Array(_) => serde_json::from_value(raw)?,
            other => vec![serde_json::from_value(other)?],
        };
        let Some(market) = markets.first() else {
            return Ok(None);
        };

        let resolved = market.resolved.unwrap_or(false)
            || market.uma_resolution_status.as_deref() == Some("resolved")
            || market.closed;
        if !resolved {
            return Ok(None);
        }

        Ok(winning_direction(market))
    }
}

fn discovery_queries(asset: &str) -> Vec<String> {
    let mut queries = vec![format!("{} up or down", asset)];
    if let Some(name) = asset_full_name(asset) {
        queries.push(format!("{} up or down", name));
    }
    queries
}

fn asset_full_name(asset: &str) -> Option<&'static str> {
    match asset {
        "BTC" => Some("Bitcoin"),
        "ETH" => Some("Ethereum"),
        "SOL" => Some("Solana"),
        "XRP" => Some("XRP"),
        _ => None,
    }
}

fn market_text(market: &GammaMarket) -> String {
    let mut text = String::new();
    for part in [&market.title, &market.question, &market.slug] {
        if let Some(part) = part {
            text.push_str(part);
            text.push(' ');
        }
    }
    text.to_lowercase()
}

fn is_up_or_down(text: &str) -> bool {
    UP_OR_DOWN_PATTERNS
        .iter()
        .any(|pattern| text.contains(pattern))
}

fn matches_asset(text: &str, asset: &str) -> bool {
    if text.contains(&asset.to_lowercase()) {
        return true;
    }
    asset_full_name(asset)
        .map(|name| text.contains(&name.to_lowercase()))
        .unwrap_or(false)
}

/// Token ids from either the `tokens[]` shape or the parallel
/// `outcomes` + `clobTokenIds` arrays (both may arrive JSON-encoded).
fn extract_token_ids(market: &GammaMarket) -> Option<(String, String)> {
    let mut up = None;
    let mut down = None;

    for token in &market.tokens {
        let outcome = token.outcome.as_deref().unwrap_or("").to_uppercase();
        let Some(token_id) = token.token_id.clone() else {
            continue;
        };
        if outcome.contains("UP") || outcome.contains("YES") {
            up = Some(token_id);
        } else if outcome.contains("DOWN") || outcome.contains("NO") {
            down = Some(token_id);
        }
    }
    if let (Some(up), Some(down)) = (&up, &down) {
        return Some((up.clone(), down.clone()));
    }

    let outcomes = market.outcomes.as_ref().and_then(string_list)?;
    let token_ids = market.clob_token_ids.as_ref().and_then(string_list)?;
    for (outcome, token_id) in outcomes.iter().zip(token_ids.iter()) {
        let outcome = outcome.to_uppercase();
        if outcome.contains("UP") || outcome.contains("YES") {
            up = Some(token_id.clone());
        } else if outcome.contains("DOWN") || outcome.contains("NO") {
            down = Some(token_id.clone());
        }
    }

    match (up, down) {
        (Some(up), Some(down)) => Some((up, down)),
        _ => None,
    }
}

/// Winner from the resolved outcome prices: the outcome priced near 1.
fn winning_direction(market: &GammaMarket) -> Option<Direction> {
    let outcomes = market.outcomes.as_ref().and_then(string_list)?;
    let prices = market.outcome_prices.as_ref().and_then(string_list)?;

    for (outcome, price) in outcomes.iter().zip(prices.iter()) {
        let price: f64 = price.parse().unwrap_or(0.0);
        if price > 0.9 {
            let outcome = outcome.to_uppercase();
            if outcome.contains("UP") || outcome.contains("YES") {
                return Some(Direction::Up);
            }
            if outcome.contains("DOWN") || outcome.contains("NO") {
                return Some(Direction::Down);
            }
        }
    }
    None
}

/// Lists arrive either as real JSON arrays or as JSON-encoded strings.
fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        Value::String(raw) => serde_json::from_str(raw).ok(),
        _ => None,
    }
}

/// Unix seconds from an epoch number (s or ms) or an ISO-8601 string.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let v = n.as_f64()?;
            if v > 1e12 {
                Some((v / 1000.0) as i64)
            } else {
                Some(v as i64)
            }
        }
        Value::String(s) => {
            if let Ok(v) = s.parse::<i64>() {
                return Some(if v > 1_000_000_000_000 { v / 1000 } else { v });
            }
            DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00"))
                .ok()
                .map(|dt| dt.timestamp())
        }
        _ => None,
    }
}
