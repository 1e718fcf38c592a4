//! Order execution
//!
//! Paper mode synthesises fills locally; live mode submits a single limit
//! order to the book and polls its status. Placement is idempotent per
//! trade: a trade that already carries an order id is never re-submitted.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::{BookClient, LimitOrder, OrderStatus};
use crate::config::ExecutionMode;
use crate::types::{Direction, FillStatus, MarketWindow, Signal, Trade};

/// Result of a placement.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub token_id: String,
    pub fill_status: FillStatus,
    pub fill_price: Option<Decimal>,
}

/// Paper/live order executor with settlement math.
pub struct ExecutionService {
    mode: ExecutionMode,
    book: Arc<dyn BookClient>,
    stake_amount: Decimal,
    price_cap: Decimal,
}

impl ExecutionService {
    pub fn new(
        mode: ExecutionMode,
        book: Arc<dyn BookClient>,
        stake_amount: Decimal,
        price_cap: Decimal,
    ) -> Self {
        Self {
            mode,
            book,
            stake_amount,
            price_cap,
        }
    }

    pub fn is_paper(&self) -> bool {
        self.mode == ExecutionMode::Paper
    }

    /// Flat stake per trade.
    pub fn stake(&self) -> Decimal {
        self.stake_amount
    }

    /// Place (or re-read) the order for a trade. Keyed by the trade: if an
    /// order id is already recorded, the stored result is returned and
    /// nothing is submitted.
    pub async fn place(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
    ) -> Result<PlacedOrder> {
        if let Some(order_id) = &trade.order_id {
            return Ok(PlacedOrder {
                order_id: order_id.clone(),
                token_id: trade.token_id.clone().unwrap_or_default(),
                fill_status: trade.fill_status,
                fill_price: trade.fill_price,
            });
        }

        let token_id = window.token_for(signal.direction).to_string();

        if self.is_paper() {
            let order_id = format!(
                "PAPER_{}",
                Uuid::new_v4().simple().to_string()[..12].to_uppercase()
            );
            info!(
                "[PAPER] {} {} on {}... stake {} at {}",
                order_id,
                signal.direction,
                &token_id[..token_id.len().min(16)],
                self.stake_amount,
                self.price_cap
            );
            return Ok(PlacedOrder {
                order_id,
                token_id,
                fill_status: FillStatus::Filled,
                fill_price: Some(self.price_cap),
            });
        }

        // Live: size = stake / price, buying the predicted outcome.
        let size = (self.stake_amount / self.price_cap).round_dp(2);
        let order = LimitOrder {
            token_id: token_id.clone(),
            price: self.price_cap,
            size,
        };
        let order_id = self
            .book
            .place_limit(&order)
            .await
            .context("limit order submission failed")?;
        info!(
            "[LIVE] order {} submitted: {} {} shares at {}",
            order_id, signal.direction, size, self.price_cap
        );

        Ok(PlacedOrder {
            order_id,
            token_id,
            fill_status: FillStatus::Pending,
            fill_price: None,
        })
    }

    /// Poll the fill state of a placed order.
    pub async fn poll_fill(&self, trade: &Trade) -> Result<(FillStatus, Option<Decimal>)> {
        if self.is_paper() {
            return Ok((FillStatus::Filled, trade.fill_price.or(Some(self.price_cap))));
        }

        let order_id = trade
            .order_id
            .as_deref()
            .context("cannot poll fill without an order id")?;
        let state = self.book.order_status(order_id).await?;

        let fill_status = match state.status {
            OrderStatus::Filled => FillStatus::Filled,
            OrderStatus::Partial => FillStatus::Partial,
            OrderStatus::Cancelled => FillStatus::Cancelled,
            OrderStatus::Expired => FillStatus::Cancelled,
            OrderStatus::Live => FillStatus::Pending,
        };
        if fill_status == FillStatus::Cancelled {
            warn!("Order {} was cancelled venue-side", order_id);
        }
        Ok((fill_status, state.fill_price.or(Some(self.price_cap))))
    }

    /// Settlement outcome for a filled trade against the resolved window.
    /// Win pays `stake * (1/fill_price - 1)`; a loss burns the stake.
    pub fn settle(&self, trade: &Trade, signal: &Signal, outcome: Direction) -> (bool, Decimal) {
        let is_win = signal.direction == outcome;
        let pnl = if is_win {
            let fill_price = trade
                .fill_price
                .filter(|p| !p.is_zero())
                .unwrap_or(self.price_cap);
            (trade.stake_amount * (Decimal::ONE / fill_price - Decimal::ONE)).round_dp(6)
        } else {
            -trade.stake_amount
        };
        (is_win, pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Decision, PolicyMode, QualityBreakdown, TradeStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBook {
        placed: AtomicU32,
    }

    #[async_trait]
    impl BookClient for FakeBook {
        async fn price_ticks(
            &self,
            _token_id: &str,
            _from_ts: i64,
            _to_ts: i64,
        ) -> Result<Vec<crate::types::PriceTick>> {
            Ok(Vec::new())
        }

        async fn place_limit(&self, _order: &LimitOrder) -> Result<String> {
            let n = self.placed.fetch_add(1, Ordering::SeqCst);
            Ok(format!("LIVE-{}", n))
        }

        async fn order_status(&self, _order_id: &str) -> Result<crate::clients::OrderState> {
            Ok(crate::clients::OrderState {
                status: OrderStatus::Filled,
                fill_price: Some(dec!(0.54)),
            })
        }
    }

    fn window() -> MarketWindow {
        MarketWindow {
            id: 1,
            asset: "BTC".into(),
            slug: "btc-up-or-down".into(),
            condition_id: "cond".into(),
            up_token_id: "tok-up".into(),
            down_token_id: "tok-down".into(),
            start_ts: 1_000_000,
            end_ts: 1_003_600,
            outcome: None,
            created_at: Utc::now(),
        }
    }

    fn signal(direction: Direction) -> Signal {
        Signal {
            id: 1,
            window_id: 1,
            direction,
            signal_ts: 1_000_300,
            confirm_ts: 1_000_420,
            quality: 50.0,
            breakdown: QualityBreakdown::default(),
            anchor_bar_ts: 1_000_000,
            created_at: Utc::now(),
        }
    }

    fn trade() -> Trade {
        Trade {
            id: 1,
            window_id: 1,
            signal_id: Some(1),
            status: TradeStatus::Ready,
            time_mode: None,
            policy_mode: PolicyMode::Base,
            decision: Decision::Ok,
            cancel_reason: None,
            token_id: None,
            order_id: None,
            fill_status: FillStatus::Pending,
            fill_price: None,
            stake_amount: dec!(10),
            pnl: None,
            is_win: None,
            trade_level_streak: 0,
            night_streak: 0,
            approval_emitted_ts: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn paper_service() -> ExecutionService {
        ExecutionService::new(
            ExecutionMode::Paper,
            Arc::new(FakeBook {
                placed: AtomicU32::new(0),
            }),
            dec!(10),
            dec!(0.55),
        )
    }

    #[tokio::test]
    async fn paper_orders_fill_instantly_at_the_cap() {
        let service = paper_service();
        let placed = service
            .place(&trade(), &signal(Direction::Up), &window())
            .await
            .unwrap();
        assert!(placed.order_id.starts_with("PAPER_"));
        assert_eq!(placed.order_id.len(), "PAPER_".len() + 12);
        assert_eq!(placed.token_id, "tok-up");
        assert_eq!(placed.fill_status, FillStatus::Filled);
        assert_eq!(placed.fill_price, Some(dec!(0.55)));
    }

    #[tokio::test]
    async fn down_signals_buy_the_down_token() {
        let service = paper_service();
        let placed = service
            .place(&trade(), &signal(Direction::Down), &window())
            .await
            .unwrap();
        assert_eq!(placed.token_id, "tok-down");
    }

    #[tokio::test]
    async fn placement_is_idempotent_per_trade() {
        let book = Arc::new(FakeBook {
            placed: AtomicU32::new(0),
        });
        let service =
            ExecutionService::new(ExecutionMode::Live, book.clone(), dec!(10), dec!(0.55));

        let mut trade = trade();
        let first = service
            .place(&trade, &signal(Direction::Up), &window())
            .await
            .unwrap();
        trade.order_id = Some(first.order_id.clone());
        trade.token_id = Some(first.token_id.clone());

        let second = service
            .place(&trade, &signal(Direction::Up), &window())
            .await
            .unwrap();
        assert_eq!(second.order_id, first.order_id);
        assert_eq!(book.placed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_fill_polling_maps_statuses() {
        let service = ExecutionService::new(
            ExecutionMode::Live,
            Arc::new(FakeBook {
                placed: AtomicU32::new(0),
            }),
            dec!(10),
            dec!(0.55),
        );
        let mut trade = trade();
        trade.order_id = Some("LIVE-0".into());
        let (status, price) = service.poll_fill(&trade).await.unwrap();
        assert_eq!(status, FillStatus::Filled);
        assert_eq!(price, Some(dec!(0.54)));
    }

    #[test]
    fn settlement_math() {
        let service = paper_service();
        let mut trade = trade();
        trade.fill_price = Some(dec!(0.55));

        let (win, pnl) = service.settle(&trade, &signal(Direction::Up), Direction::Up);
        assert!(win);
        // 10 * (1/0.55 - 1) = 8.181818...
        assert_eq!(pnl, dec!(8.181818));

        let (win, pnl) = service.settle(&trade, &signal(Direction::Up), Direction::Down);
        assert!(!win);
        assert_eq!(pnl, dec!(-10));
    }
}
