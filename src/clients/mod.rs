//! Outbound client seams
//!
//! The orchestrator and workers program against these traits; the real
//! implementations are thin reqwest adapters, and the integration tests
//! substitute scripted fakes.

pub mod binance;
pub mod clob;
pub mod error;
pub mod gamma;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Candle, CandleInterval, Direction, MarketWindow, PriceTick};

pub use binance::BinanceClient;
pub use clob::ClobClient;
pub use error::ApiError;
pub use gamma::GammaClient;
pub use retry::{with_retry, RetryConfig};

/// A window found by discovery; the ledger assigns ids on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredWindow {
    pub asset: String,
    pub slug: String,
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

/// Market catalog: discovery of open hourly windows and resolution lookups.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    async fn list_open_windows(&self, assets: &[String], now: i64)
        -> Result<Vec<DiscoveredWindow>>;

    /// Resolved outcome for a window, or None while unresolved.
    async fn resolved_outcome(&self, window: &MarketWindow) -> Result<Option<Direction>>;
}

/// Candle source for the snapshot worker.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn candles(
        &self,
        asset: &str,
        interval: CandleInterval,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Candle>>;
}

/// Buy side of a limit order (the bot only ever buys the predicted outcome).
#[derive(Debug, Clone)]
pub struct LimitOrder {
    pub token_id: String,
    pub price: Decimal,
    /// Number of outcome shares
    pub size: Decimal,
}

/// Venue-side order state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    Filled,
    Partial,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub fill_price: Option<Decimal>,
}

/// Order book: price history for CAP checks plus the live order surface.
#[async_trait]
pub trait BookClient: Send + Sync {
    /// Ascending `(ts, price)` observations in `[from_ts, to_ts]`.
    async fn price_ticks(&self, token_id: &str, from_ts: i64, to_ts: i64)
        -> Result<Vec<PriceTick>>;

    /// Submit a limit order; returns the venue order id.
    async fn place_limit(&self, order: &LimitOrder) -> Result<String>;

    async fn order_status(&self, order_id: &str) -> Result<OrderState>;
}
