//! End-to-end orchestrator flows against scripted clients and an in-memory
//! ledger. Cycles are driven with explicit timestamps so every timing rule
//! is deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use martin::clients::{
    BookClient, DiscoveredWindow, LimitOrder, MarketCatalog, OrderState, OrderStatus,
};
use martin::config::Config;
use martin::db::Database;
use martin::notifier::{decision_channel, DecisionSender, NullNotifier};
use martin::services::snapshot::SnapshotCache;
use martin::ta::{SignalOracle, TaSignal};
use martin::types::{
    CancelReason, CapStatus, Candle, CapCheck, Decision, Direction, FillStatus, MarketWindow,
    PolicyMode, PriceTick, QualityBreakdown, Trade, TradeStatus, UserDecision,
};
use martin::Orchestrator;

const WINDOW_START: i64 = 1_000_000;
const WINDOW_END: i64 = 1_003_600;
const SLUG: &str = "btc-up-or-down-1pm-et";

struct FakeCatalog {
    windows: Mutex<Vec<DiscoveredWindow>>,
    outcomes: Mutex<HashMap<String, Direction>>,
}

#[async_trait]
impl MarketCatalog for FakeCatalog {
    async fn list_open_windows(
        &self,
        _assets: &[String],
        _now: i64,
    ) -> Result<Vec<DiscoveredWindow>> {
        Ok(self.windows.lock().unwrap().clone())
    }

    async fn resolved_outcome(&self, window: &MarketWindow) -> Result<Option<Direction>> {
        Ok(self.outcomes.lock().unwrap().get(&window.slug).copied())
    }
}

struct FakeBook {
    ticks: Mutex<HashMap<String, Vec<PriceTick>>>,
}

#[async_trait]
impl BookClient for FakeBook {
    async fn price_ticks(
        &self,
        token_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<PriceTick>> {
        Ok(self
            .ticks
            .lock()
            .unwrap()
            .get(token_id)
            .map(|ticks| {
                ticks
                    .iter()
                    .filter(|t| t.ts >= from_ts && t.ts <= to_ts)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn place_limit(&self, _order: &LimitOrder) -> Result<String> {
        Ok("LIVE-TEST".to_string())
    }

    async fn order_status(&self, _order_id: &str) -> Result<OrderState> {
        Ok(OrderState {
            status: OrderStatus::Filled,
            fill_price: Some(dec!(0.55)),
        })
    }
}

/// Pops one scripted response per evaluation; an exhausted script means
/// "no signal".
struct ScriptedOracle {
    script: Mutex<VecDeque<Option<TaSignal>>>,
}

impl SignalOracle for ScriptedOracle {
    fn evaluate(
        &self,
        _window: &MarketWindow,
        _now: i64,
        _candles_1m: &[Candle],
        _candles_5m: &[Candle],
    ) -> Option<TaSignal> {
        self.script.lock().unwrap().pop_front().flatten()
    }
}

fn ta_signal(direction: Direction, signal_ts: i64, quality: f64) -> TaSignal {
    TaSignal {
        direction,
        signal_ts,
        quality,
        breakdown: QualityBreakdown {
            final_quality: quality,
            ..Default::default()
        },
        anchor_bar_ts: WINDOW_START,
    }
}

fn discovered_window() -> DiscoveredWindow {
    DiscoveredWindow {
        asset: "BTC".to_string(),
        slug: SLUG.to_string(),
        condition_id: "cond-1".to_string(),
        up_token_id: "tok-up".to_string(),
        down_token_id: "tok-down".to_string(),
        start_ts: WINDOW_START,
        end_ts: WINDOW_END,
    }
}

/// Day config: at the test epoch (hour 13 UTC) 8..22 is DAY.
fn day_config() -> Config {
    let mut config = Config::default();
    config.app.timezone = "UTC".to_string();
    config.trading.assets = vec!["BTC".to_string()];
    config.trading.price_cap = dec!(0.55);
    config.trading.confirm_delay_seconds = 120;
    config.trading.cap_min_ticks = 3;
    config.day_night.base_day_min_quality = 35.0;
    config.day_night.base_night_min_quality = 35.0;
    config.day_night.max_response_seconds = 600;
    config
}

/// Night config: the day span 20..6 makes hour 13 NIGHT.
fn night_config() -> Config {
    let mut config = day_config();
    config.day_night.day_start_hour = 20;
    config.day_night.day_end_hour = 6;
    config.day_night.night_autotrade_enabled = true;
    config
}

struct Harness {
    db: Database,
    orchestrator: Orchestrator,
    catalog: Arc<FakeCatalog>,
    book: Arc<FakeBook>,
    oracle: Arc<ScriptedOracle>,
    snapshots: SnapshotCache,
    decisions: DecisionSender,
}

impl Harness {
    async fn new(config: Config) -> Self {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let catalog = Arc::new(FakeCatalog {
            windows: Mutex::new(vec![discovered_window()]),
            outcomes: Mutex::new(HashMap::new()),
        });
        let book = Arc::new(FakeBook {
            ticks: Mutex::new(HashMap::new()),
        });
        let oracle = Arc::new(ScriptedOracle {
            script: Mutex::new(VecDeque::new()),
        });
        let snapshots = SnapshotCache::new();
        let (decisions, decision_rx) = decision_channel();

        let orchestrator = Orchestrator::new(
            db.clone(),
            config,
            catalog.clone(),
            book.clone(),
            oracle.clone(),
            snapshots.clone(),
            Arc::new(NullNotifier),
            decision_rx,
        )
        .unwrap();

        Self {
            db,
            orchestrator,
            catalog,
            book,
            oracle,
            snapshots,
            decisions,
        }
    }

    fn script(&self, responses: Vec<Option<TaSignal>>) {
        self.oracle.script.lock().unwrap().extend(responses);
    }

    fn set_ticks(&self, token_id: &str, ticks: Vec<(i64, Decimal)>) {
        self.book.ticks.lock().unwrap().insert(
            token_id.to_string(),
            ticks
                .into_iter()
                .map(|(ts, price)| PriceTick { ts, price })
                .collect(),
        );
    }

    fn resolve(&self, outcome: Direction) {
        self.catalog
            .outcomes
            .lock()
            .unwrap()
            .insert(SLUG.to_string(), outcome);
    }

    async fn cycle(&self, now: i64) {
        // Keep the snapshot fresh for the scan; content is irrelevant to
        // the scripted oracle.
        let candle = Candle {
            t: now - 60,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        self.snapshots
            .update("BTC", vec![candle], vec![candle], now)
            .await;
        self.orchestrator.run_cycle(now).await.unwrap();
    }

    async fn trade(&self) -> Trade {
        let mut all = self.db.active_trades().await.unwrap();
        if all.is_empty() {
            all = self.db.settled_trades(10).await.unwrap();
        }
        if all.is_empty() {
            // Cancelled / errored trades are neither active nor settled.
            for id in 1..20 {
                if let Some(trade) = self.db.trade_by_id(id).await.unwrap() {
                    return trade;
                }
            }
            panic!("no trade found");
        }
        all.into_iter().next().unwrap()
    }

    async fn cap_check(&self, trade_id: i64) -> Option<CapCheck> {
        self.db.cap_check_for_trade(trade_id).await.unwrap()
    }

    async fn decide(&self, trade_id: i64, approve: bool) {
        self.decisions
            .send(UserDecision { trade_id, approve })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn s1_day_flow_happy_path() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_421, dec!(0.50)),
            (1_000_431, dec!(0.54)),
            (1_000_441, dec!(0.52)),
        ],
    );

    // Cycle 1: discovery creates the trade and the scan accepts the signal.
    harness.cycle(1_000_310).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Signalled);
    let signal = harness.db.signal_by_id(trade.signal_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(signal.direction, Direction::Up);
    assert_eq!(signal.confirm_ts, 1_000_420);

    // Cycle 2 at the confirm time: collapse through WAITING_CONFIRM into
    // WAITING_CAP with a cap check in place.
    harness.cycle(1_000_420).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::WaitingCap);
    let check = harness.cap_check(trade.id).await.unwrap();
    assert_eq!(check.status, CapStatus::Pending);

    // Cycle 3: three consecutive in-cap ticks validate the entry.
    harness.cycle(1_000_500).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Ready);
    let check = harness.cap_check(trade.id).await.unwrap();
    assert_eq!(check.status, CapStatus::Pass);
    assert_eq!(check.first_pass_ts, Some(1_000_441));
    assert!(check.consecutive_ticks >= 3);

    // Cycle 4: the approval card goes out.
    harness.cycle(1_000_560).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Ready);
    assert_eq!(trade.approval_emitted_ts, Some(1_000_560));

    // User approves; cycle 5 places the paper order.
    harness.decide(trade.id, true).await;
    harness.cycle(1_000_620).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::OrderPlaced);
    assert_eq!(trade.decision, Decision::Ok);
    assert!(trade.order_id.as_deref().unwrap().starts_with("PAPER_"));
    assert_eq!(trade.fill_status, FillStatus::Filled);
    assert_eq!(trade.fill_price, Some(dec!(0.55)));

    // Window resolves UP; cycle 6 settles the win.
    harness.resolve(Direction::Up);
    harness.cycle(WINDOW_END + 100).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Settled);
    assert_eq!(trade.is_win, Some(true));
    assert_eq!(trade.pnl, Some(dec!(8.181818)));

    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stats.trade_level_streak, 1);
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.total_wins, 1);
}

#[tokio::test]
async fn s2_late_confirm_cancels_late() {
    let harness = Harness::new(day_config()).await;
    // signal at 1_003_500 -> confirm 1_003_620 >= window end 1_003_600.
    harness.script(vec![Some(ta_signal(Direction::Up, 1_003_500, 50.0))]);

    harness.cycle(1_003_510).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::Late));
    assert_eq!(trade.decision, Decision::AutoSkip);

    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stats.trade_level_streak, 0);
    assert_eq!(stats.total_trades, 0);
}

#[tokio::test]
async fn s3_pre_confirm_dips_never_pass_the_cap() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    // Cheap ticks strictly before confirm (1_000_420), expensive after.
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_400, dec!(0.40)),
            (1_000_410, dec!(0.42)),
            (1_000_425, dec!(0.60)),
            (1_000_500, dec!(0.58)),
        ],
    );

    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::WaitingCap);

    // Mid-window: still pending, and the pre-confirm run was not counted.
    harness.cycle(1_000_600).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::WaitingCap);
    let check = harness.cap_check(trade.id).await.unwrap();
    assert_eq!(check.status, CapStatus::Pending);
    assert_eq!(check.consecutive_ticks, 0);

    // Window end with no qualifying run: CAP_FAIL.
    harness.cycle(WINDOW_END).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::CapFail));
}

#[tokio::test]
async fn s4_searching_holds_until_a_qualifying_signal() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![
        Some(ta_signal(Direction::Up, 1_000_100, 20.0)),
        None,
        Some(ta_signal(Direction::Up, 1_000_300, 40.0)),
    ]);

    // Low quality: stay searching, nothing persisted.
    harness.cycle(1_000_150).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::SearchingSignal);
    assert!(trade.signal_id.is_none());
    assert!(harness
        .db
        .signal_for_window(trade.window_id)
        .await
        .unwrap()
        .is_none());

    // No signal at all: stay searching.
    harness.cycle(1_000_210).await;
    assert_eq!(harness.trade().await.status, TradeStatus::SearchingSignal);

    // Qualifying signal: the third detection is the one persisted.
    harness.cycle(1_000_310).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Signalled);
    let signal = harness.db.signal_by_id(trade.signal_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(signal.signal_ts, 1_000_300);
    assert_eq!(signal.quality, 40.0);
}

#[tokio::test]
async fn s5_night_auto_ok_with_soft_session_reset() {
    let mut config = night_config();
    config.day_night.night_max_win_streak = 5;
    config.day_night.switch_streak_at = 3;
    let harness = Harness::new(config).await;

    // Seed a strict-mode run: 4 straight wins, 4 of them at night.
    let mut stats = harness.db.stats().await.unwrap();
    stats.trade_level_streak = 4;
    stats.night_streak = 4;
    stats.policy_mode = PolicyMode::Strict;
    stats.total_trades = 4;
    stats.total_wins = 4;
    harness.db.update_stats(&stats).await.unwrap();

    // STRICT threshold: 35 + (4 - 3 + 1) * 5 = 45; quality 60 qualifies.
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 60.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );

    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;

    // Night mode auto-confirms and places in the same cycle.
    harness.cycle(1_000_560).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::OrderPlaced);
    assert_eq!(trade.decision, Decision::AutoOk);

    harness.resolve(Direction::Up);
    harness.cycle(WINDOW_END + 100).await;

    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Settled);
    assert_eq!(trade.is_win, Some(true));

    // The win took the night streak to the cap of 5, so the SOFT reset
    // fires: night streak cleared, policy back to BASE, trade-level streak
    // kept.
    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stats.night_streak, 0);
    assert_eq!(stats.policy_mode, PolicyMode::Base);
    assert_eq!(stats.trade_level_streak, 5);
    assert_eq!(stats.total_wins, 5);
}

#[tokio::test]
async fn s6_response_timeout_auto_skips() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );

    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;

    // Approval emitted at t0.
    let t0 = 1_000_560;
    harness.cycle(t0).await;
    let trade = harness.trade().await;
    assert_eq!(trade.approval_emitted_ts, Some(t0));

    // Just before the deadline nothing happens.
    harness.cycle(t0 + 599).await;
    assert_eq!(harness.trade().await.status, TradeStatus::Ready);

    // At the deadline the trade is auto-skipped, not counted as a loss.
    harness.cycle(t0 + 600).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::Expired));
    assert_eq!(trade.decision, Decision::AutoSkip);

    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stats.trade_level_streak, 0);
    assert_eq!(stats.total_trades, 0);
    assert_eq!(stats.total_losses, 0);
}

#[tokio::test]
async fn user_skip_cancels_with_skip_reason() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );

    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;
    harness.cycle(1_000_560).await;

    let trade = harness.trade().await;
    harness.decide(trade.id, false).await;
    harness.cycle(1_000_620).await;

    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::Skip));
    assert_eq!(trade.decision, Decision::Skip);
}

#[tokio::test]
async fn night_disabled_cancels_at_ready() {
    let mut config = night_config();
    config.day_night.night_autotrade_enabled = false;
    let harness = Harness::new(config).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );

    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;

    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Ready);

    harness.cycle(1_000_560).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::NightDisabled));
}

#[tokio::test]
async fn discovery_is_idempotent_per_window() {
    let harness = Harness::new(day_config()).await;
    // No signal ever arrives; the single trade keeps searching.
    harness.cycle(1_000_100).await;
    harness.cycle(1_000_200).await;
    harness.cycle(1_000_300).await;

    let active = harness.db.active_trades().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, TradeStatus::SearchingSignal);
}

#[tokio::test]
async fn replaying_a_cycle_without_new_inputs_changes_nothing() {
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);

    harness.cycle(1_000_310).await;
    let before = harness.trade().await;
    assert_eq!(before.status, TradeStatus::Signalled);

    // Same timestamp again: the script is exhausted (no new external
    // input) and the trade is already SIGNALLED with now < confirm_ts, so
    // nothing moves and no rows appear.
    harness.cycle(1_000_310).await;
    let after = harness.trade().await;
    assert_eq!(after.status, before.status);
    assert_eq!(after.signal_id, before.signal_id);
    let active = harness.db.active_trades().await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn window_expiry_without_signal_cancels_no_signal() {
    let harness = Harness::new(day_config()).await;
    harness.cycle(1_000_100).await;
    assert_eq!(harness.trade().await.status, TradeStatus::SearchingSignal);

    harness.cycle(WINDOW_END).await;
    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert_eq!(trade.cancel_reason, Some(CancelReason::NoSignal));
}

#[tokio::test]
async fn paused_bot_does_not_open_trades_but_keeps_settling() {
    let harness = Harness::new(day_config()).await;

    // Walk one trade to ORDER_PLACED.
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );
    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;
    harness.cycle(1_000_560).await;
    let trade = harness.trade().await;
    harness.decide(trade.id, true).await;
    harness.cycle(1_000_620).await;
    assert_eq!(harness.trade().await.status, TradeStatus::OrderPlaced);

    // Pause, add a second window; no new trade may appear, but the open
    // one still settles.
    let mut stats = harness.db.stats().await.unwrap();
    stats.is_paused = true;
    harness.db.update_stats(&stats).await.unwrap();

    harness.catalog.windows.lock().unwrap().push(DiscoveredWindow {
        slug: "btc-up-or-down-2pm-et".to_string(),
        start_ts: WINDOW_END,
        end_ts: WINDOW_END + 3600,
        ..discovered_window()
    });
    harness.resolve(Direction::Up);
    harness.cycle(WINDOW_END + 100).await;

    let settled = harness.db.settled_trades(10).await.unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].is_win, Some(true));
    assert!(harness.db.active_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn losing_trade_resets_streaks() {
    let harness = Harness::new(day_config()).await;

    let mut stats = harness.db.stats().await.unwrap();
    stats.trade_level_streak = 2;
    stats.total_trades = 2;
    stats.total_wins = 2;
    harness.db.update_stats(&stats).await.unwrap();

    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );
    harness.cycle(1_000_310).await;
    harness.cycle(1_000_420).await;
    harness.cycle(1_000_500).await;
    harness.cycle(1_000_560).await;
    let trade = harness.trade().await;
    harness.decide(trade.id, true).await;
    harness.cycle(1_000_620).await;

    harness.resolve(Direction::Down);
    harness.cycle(WINDOW_END + 100).await;

    let trade = harness.trade().await;
    assert_eq!(trade.status, TradeStatus::Settled);
    assert_eq!(trade.is_win, Some(false));
    assert_eq!(trade.pnl, Some(dec!(-10)));

    let stats = harness.db.stats().await.unwrap();
    assert_eq!(stats.trade_level_streak, 0);
    assert_eq!(stats.policy_mode, PolicyMode::Base);
    assert_eq!(stats.total_losses, 1);
    assert_eq!(stats.total_trades, 3);
}

#[tokio::test]
async fn settled_statuses_follow_the_transition_graph() {
    // Every status observed while driving the happy path must be a step on
    // the legal path.
    let harness = Harness::new(day_config()).await;
    harness.script(vec![Some(ta_signal(Direction::Up, 1_000_300, 50.0))]);
    harness.set_ticks(
        "tok-up",
        vec![
            (1_000_430, dec!(0.50)),
            (1_000_440, dec!(0.51)),
            (1_000_450, dec!(0.52)),
        ],
    );

    let mut observed = Vec::new();
    for now in [1_000_310, 1_000_420, 1_000_500, 1_000_560] {
        harness.cycle(now).await;
        observed.push(harness.trade().await.status);
    }
    let trade = harness.trade().await;
    harness.decide(trade.id, true).await;
    harness.cycle(1_000_620).await;
    observed.push(harness.trade().await.status);
    harness.resolve(Direction::Up);
    harness.cycle(WINDOW_END + 100).await;
    observed.push(harness.trade().await.status);

    let expected = [
        TradeStatus::Signalled,
        TradeStatus::WaitingCap,
        TradeStatus::Ready,
        TradeStatus::Ready,
        TradeStatus::OrderPlaced,
        TradeStatus::Settled,
    ];
    assert_eq!(observed, expected);

    // is_win/pnl are set exactly at SETTLED (never before).
    let trade = harness.trade().await;
    assert!(trade.is_win.is_some());
    assert!(trade.pnl.is_some());
}
