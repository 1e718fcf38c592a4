//! Trading orchestrator
//!
//! The per-tick driver. Each cycle: drain user decisions, discover new
//! windows, advance every non-terminal trade by (at most) one legal step,
//! and sweep settlements. Trades are processed under per-trade advisory
//! locks shared with the decision intake path, and every status write goes
//! through the ledger's guarded transition, so a failure on one trade can
//! never corrupt another.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clients::{ApiError, BookClient, MarketCatalog};
use crate::config::Config;
use crate::db::{Database, TradeUpdate};
use crate::notifier::Notifier;
use crate::services::cap_check::CapCheckService;
use crate::services::execution::ExecutionService;
use crate::services::snapshot::SnapshotCache;
use crate::services::stats::{apply_night_session_reset, StatsService};
use crate::services::time_mode::TimeModeService;
use crate::ta::SignalOracle;
use crate::types::{
    CancelReason, CapStatus, Decision, FillStatus, MarketWindow, NightSessionMode, Signal, Stats,
    TimeMode, Trade, TradeStatus, UserDecision,
};

/// Settlement polling: every cycle while the window is this recently over,
/// then only every N-th cycle, and ERROR after the hard timeout.
const SETTLEMENT_FAST_WINDOW_SECONDS: i64 = 900;
const SETTLEMENT_SLOW_POLL_CYCLES: u64 = 5;
const SETTLEMENT_HARD_TIMEOUT_SECONDS: i64 = 86_400;

/// Per-trade advisory locks. Decision intake and cycle processing both
/// acquire the same lock, so two transitions can never race on one trade.
#[derive(Default)]
struct TradeLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TradeLocks {
    async fn acquire(&self, trade_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(trade_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct Orchestrator {
    db: Database,
    config: Config,
    catalog: Arc<dyn MarketCatalog>,
    oracle: Arc<dyn SignalOracle>,
    snapshots: SnapshotCache,
    notifier: Arc<dyn Notifier>,
    time_mode: TimeModeService,
    stats: StatsService,
    execution: ExecutionService,
    cap_check: CapCheckService,
    decisions: Mutex<mpsc::Receiver<UserDecision>>,
    locks: TradeLocks,
    cycle_counter: AtomicU64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        config: Config,
        catalog: Arc<dyn MarketCatalog>,
        book: Arc<dyn BookClient>,
        oracle: Arc<dyn SignalOracle>,
        snapshots: SnapshotCache,
        notifier: Arc<dyn Notifier>,
        decisions: mpsc::Receiver<UserDecision>,
    ) -> Result<Self> {
        let tz = config.timezone()?;
        let time_mode = TimeModeService::new(
            tz,
            config.day_night.day_start_hour,
            config.day_night.day_end_hour,
        );
        let stats = StatsService::new(
            db.clone(),
            config.day_night.clone(),
            config.rolling_quantile.clone(),
        );
        let execution = ExecutionService::new(
            config.execution.mode,
            book.clone(),
            config.execution.stake_amount,
            config.trading.price_cap,
        );
        let cap_check = CapCheckService::new(
            db.clone(),
            book,
            config.trading.price_cap,
            config.trading.cap_min_ticks,
        );

        Ok(Self {
            db,
            config,
            catalog,
            oracle,
            snapshots,
            notifier,
            time_mode,
            stats,
            execution,
            cap_check,
            decisions: Mutex::new(decisions),
            locks: TradeLocks::default(),
            cycle_counter: AtomicU64::new(0),
        })
    }

    /// Main loop. One cycle per tick period; overruns coalesce instead of
    /// piling up. A stop signal finishes the in-flight cycle, then returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Refresh the rolling thresholds once up front; the settled-trade
        // path keeps them warm from here.
        if let Err(e) = self
            .stats
            .update_rolling_quantiles(chrono::Utc::now().timestamp())
            .await
        {
            warn!("Rolling quantile refresh failed: {:#}", e);
        }

        let mut ticker = interval(Duration::from_secs(self.config.loops.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(e) = self.run_cycle(now).await {
                        error!("Cycle failed: {:#}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Orchestrator stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One orchestration cycle at wall-clock `now`. Public so tests (and
    /// operational tooling) can drive time explicitly.
    pub async fn run_cycle(&self, now: i64) -> Result<()> {
        let cycle_id = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;

        self.drain_decisions().await;

        let stats = self.db.stats().await?;
        let time_mode = self.time_mode.mode_at(now);

        info!(
            "Cycle {} at {} ({}, policy {}, streak {}/{}{})",
            cycle_id,
            now,
            time_mode,
            stats.policy_mode,
            stats.trade_level_streak,
            stats.night_streak,
            if stats.is_paused { ", PAUSED" } else { "" }
        );

        let mode_excluded = (stats.day_only && time_mode == TimeMode::Night)
            || (stats.night_only && time_mode == TimeMode::Day);

        if !stats.is_paused && !mode_excluded {
            if let Err(e) = self.discover(now, time_mode, &stats).await {
                error!("Discovery failed: {:#}", e);
            }
        } else {
            debug!("Cycle {}: discovery skipped (paused or mode-excluded)", cycle_id);
        }

        self.process_trades(now, time_mode, &stats, mode_excluded, cycle_id)
            .await;

        Ok(())
    }

    /// Apply queued user decisions under the same per-trade locks the cycle
    /// uses. Only READY trades with a PENDING decision are eligible.
    async fn drain_decisions(&self) {
        let mut receiver = self.decisions.lock().await;
        while let Ok(decision) = receiver.try_recv() {
            if let Err(e) = self.apply_decision(decision).await {
                warn!(
                    "Failed to apply decision for trade {}: {:#}",
                    decision.trade_id, e
                );
            }
        }
    }

    async fn apply_decision(&self, decision: UserDecision) -> Result<()> {
        let _guard = self.locks.acquire(decision.trade_id).await;

        let Some(trade) = self.db.trade_by_id(decision.trade_id).await? else {
            warn!("Decision for unknown trade {}", decision.trade_id);
            return Ok(());
        };
        if trade.status != TradeStatus::Ready || trade.decision != Decision::Pending {
            info!(
                "Ignoring decision for trade {} in {} ({})",
                trade.id, trade.status, trade.decision
            );
            return Ok(());
        }

        if decision.approve {
            info!("User approved trade {}", trade.id);
            self.db
                .update_trade(
                    trade.id,
                    TradeUpdate {
                        decision: Some(Decision::Ok),
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            info!("User skipped trade {}", trade.id);
            self.db
                .transition(
                    trade.id,
                    TradeStatus::Cancelled,
                    TradeUpdate {
                        decision: Some(Decision::Skip),
                        cancel_reason: Some(CancelReason::Skip),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Discovery step: every currently open window without a non-terminal
    /// trade gets one, created NEW and advanced to SEARCHING_SIGNAL. This is
    /// the only path that creates trades; re-discovery is a no-op.
    async fn discover(&self, now: i64, time_mode: TimeMode, stats: &Stats) -> Result<()> {
        let discovered = self
            .catalog
            .list_open_windows(&self.config.trading.assets, now)
            .await
            .context("market catalog query failed")?;

        for found in discovered {
            let result: Result<()> = async {
                let window = match self.db.window_by_slug(&found.slug).await? {
                    Some(window) => window,
                    None => {
                        self.db
                            .insert_window(
                                &found.asset,
                                &found.slug,
                                &found.condition_id,
                                &found.up_token_id,
                                &found.down_token_id,
                                found.start_ts,
                                found.end_ts,
                            )
                            .await?
                    }
                };

                if window.is_expired(now) {
                    return Ok(());
                }
                if self
                    .db
                    .non_terminal_trade_for_window(window.id)
                    .await?
                    .is_some()
                {
                    debug!("Window {} already has a live trade", window.slug);
                    return Ok(());
                }

                let trade = self
                    .db
                    .create_trade(
                        window.id,
                        time_mode,
                        stats.policy_mode,
                        stats.trade_level_streak,
                        stats.night_streak,
                    )
                    .await?;
                self.db
                    .transition(trade.id, TradeStatus::SearchingSignal, TradeUpdate::default())
                    .await?;
                info!(
                    "Trade {} searching for a signal in {} (ends {})",
                    trade.id, window.slug, window.end_ts
                );
                Ok(())
            }
            .await;

            if let Err(e) = result {
                warn!("Discovery failed for window {}: {:#}", found.slug, e);
            }
        }
        Ok(())
    }

    /// Advance every non-terminal trade. Failures are isolated per trade.
    async fn process_trades(
        &self,
        now: i64,
        time_mode: TimeMode,
        stats: &Stats,
        mode_excluded: bool,
        cycle_id: u64,
    ) {
        let trades = match self.db.active_trades().await {
            Ok(trades) => trades,
            Err(e) => {
                error!("Failed to list active trades: {:#}", e);
                return;
            }
        };

        for trade in trades {
            let trade_id = trade.id;
            let _guard = self.locks.acquire(trade_id).await;

            if let Err(e) = self
                .process_trade(trade_id, now, time_mode, stats, mode_excluded, cycle_id)
                .await
            {
                error!("Trade {} processing failed: {:#}", trade_id, e);
            }
        }
    }

    async fn process_trade(
        &self,
        trade_id: i64,
        now: i64,
        time_mode: TimeMode,
        stats: &Stats,
        mode_excluded: bool,
        cycle_id: u64,
    ) -> Result<()> {
        // Re-read under the lock: a decision may have moved the trade since
        // the listing.
        let Some(trade) = self.db.trade_by_id(trade_id).await? else {
            return Ok(());
        };
        if trade.is_terminal() {
            return Ok(());
        }

        let window = self
            .db
            .window_by_id(trade.window_id)
            .await?
            .with_context(|| format!("window {} missing for trade {}", trade.window_id, trade.id))?;

        match trade.status {
            TradeStatus::New => self.handle_new(&trade, &window, now, stats).await,
            TradeStatus::SearchingSignal => {
                self.handle_searching(&trade, &window, now, time_mode, stats, mode_excluded)
                    .await
            }
            TradeStatus::Signalled => {
                let signal = self.required_signal(&trade).await?;
                self.advance_signalled(&trade, &signal, &window, now, time_mode, stats)
                    .await
            }
            TradeStatus::WaitingConfirm => {
                let signal = self.required_signal(&trade).await?;
                self.handle_waiting_confirm(&trade, &signal, &window, now).await
            }
            TradeStatus::WaitingCap => {
                let signal = self.required_signal(&trade).await?;
                self.handle_waiting_cap(&trade, &signal, &window, now).await
            }
            TradeStatus::Ready => {
                let signal = self.required_signal(&trade).await?;
                self.handle_ready(&trade, &signal, &window, now, time_mode).await
            }
            TradeStatus::OrderPlaced => {
                let signal = self.required_signal(&trade).await?;
                self.handle_order_placed(&trade, &signal, &window, now, cycle_id)
                    .await
            }
            TradeStatus::Settled | TradeStatus::Cancelled | TradeStatus::Error => Ok(()),
        }
    }

    async fn required_signal(&self, trade: &Trade) -> Result<Signal> {
        let signal_id = trade
            .signal_id
            .with_context(|| format!("trade {} in {} has no signal", trade.id, trade.status))?;
        self.db
            .signal_by_id(signal_id)
            .await?
            .with_context(|| format!("signal {} missing for trade {}", signal_id, trade.id))
    }

    /// NEW trades only exist between creation and the start of the search;
    /// while paused they are cancelled rather than advanced.
    async fn handle_new(
        &self,
        trade: &Trade,
        window: &MarketWindow,
        now: i64,
        stats: &Stats,
    ) -> Result<()> {
        if stats.is_paused {
            self.cancel(trade, CancelReason::Paused).await?;
            return Ok(());
        }
        if window.is_expired(now) {
            self.cancel(trade, CancelReason::NoSignal).await?;
            return Ok(());
        }
        self.db
            .transition(trade.id, TradeStatus::SearchingSignal, TradeUpdate::default())
            .await?;
        Ok(())
    }

    /// SEARCHING_SIGNAL: scan the snapshot for a qualifying signal. No
    /// signal or a quality below the threshold means hold; a better signal
    /// may still appear before the window closes.
    async fn handle_searching(
        &self,
        trade: &Trade,
        window: &MarketWindow,
        now: i64,
        time_mode: TimeMode,
        stats: &Stats,
        mode_excluded: bool,
    ) -> Result<()> {
        if window.is_expired(now) {
            info!("Trade {}: window expired without a signal", trade.id);
            self.cancel(trade, CancelReason::NoSignal).await?;
            return Ok(());
        }
        if stats.is_paused || mode_excluded {
            return Ok(());
        }

        let Some(snapshot) = self.snapshots.get_fresh(&window.asset, now).await else {
            debug!(
                "Trade {}: no fresh snapshot for {}, holding",
                trade.id, window.asset
            );
            return Ok(());
        };

        let Some(detected) =
            self.oracle
                .evaluate(window, now, &snapshot.candles_1m, &snapshot.candles_5m)
        else {
            debug!("Trade {}: no signal this tick", trade.id);
            return Ok(());
        };

        let threshold = self.stats.acceptance_threshold(stats, time_mode);
        if detected.quality < threshold {
            info!(
                "Trade {}: signal quality {:.2} below threshold {:.2}, waiting for better",
                trade.id, detected.quality, threshold
            );
            return Ok(());
        }

        let confirm_ts = detected.signal_ts + self.config.trading.confirm_delay_seconds;

        // One signal per window: reuse the persisted row if an earlier trade
        // on this window already recorded one.
        let signal = match self.db.signal_for_window(window.id).await? {
            Some(signal) => signal,
            None => {
                self.db
                    .insert_signal(
                        window.id,
                        detected.direction,
                        detected.signal_ts,
                        confirm_ts,
                        detected.quality,
                        &detected.breakdown,
                        detected.anchor_bar_ts,
                    )
                    .await?
            }
        };

        let token_id = window.token_for(signal.direction).to_string();
        let trade = self
            .db
            .transition(
                trade.id,
                TradeStatus::Signalled,
                TradeUpdate {
                    signal_id: Some(signal.id),
                    token_id: Some(token_id),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            "Trade {}: signal accepted ({} q={:.2} >= {:.2}, confirm at {})",
            trade.id, signal.direction, signal.quality, threshold, signal.confirm_ts
        );
        self.notifier
            .notify(&format!(
                "Signal accepted for {}: {} (quality {:.2})",
                window.slug, signal.direction, signal.quality
            ))
            .await;

        // Collapse immediately when the guards are already decided.
        self.advance_signalled(&trade, &signal, window, now, time_mode, stats)
            .await
    }

    /// SIGNALLED: cancel LATE if the confirmation can never land in-window,
    /// cancel LOW_QUALITY if the strict threshold has since risen past the
    /// signal, otherwise advance once the confirm time has been reached.
    /// When the guard is already met the WAITING_CONFIRM hop collapses
    /// straight into WAITING_CAP in the same cycle.
    async fn advance_signalled(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
        now: i64,
        time_mode: TimeMode,
        stats: &Stats,
    ) -> Result<()> {
        if signal.confirm_ts >= window.end_ts {
            info!(
                "Trade {}: confirm {} is past window end {}, too late",
                trade.id, signal.confirm_ts, window.end_ts
            );
            self.cancel(trade, CancelReason::Late).await?;
            return Ok(());
        }

        let threshold = self.stats.acceptance_threshold(stats, time_mode);
        if signal.quality < threshold {
            info!(
                "Trade {}: quality {:.2} fell below the current threshold {:.2}",
                trade.id, signal.quality, threshold
            );
            self.cancel(trade, CancelReason::LowQuality).await?;
            return Ok(());
        }

        if now < signal.confirm_ts {
            return Ok(());
        }

        let trade = self
            .db
            .transition(trade.id, TradeStatus::WaitingConfirm, TradeUpdate::default())
            .await?;
        self.enter_waiting_cap(&trade, signal, window).await
    }

    async fn handle_waiting_confirm(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
        now: i64,
    ) -> Result<()> {
        if window.is_expired(now) {
            self.cancel(trade, CancelReason::Expired).await?;
            return Ok(());
        }
        if now < signal.confirm_ts {
            return Ok(());
        }
        self.enter_waiting_cap(trade, signal, window).await
    }

    async fn enter_waiting_cap(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
    ) -> Result<()> {
        let trade = self
            .db
            .transition(trade.id, TradeStatus::WaitingCap, TradeUpdate::default())
            .await?;
        let token_id = trade
            .token_id
            .clone()
            .unwrap_or_else(|| window.token_for(signal.direction).to_string());
        self.cap_check
            .ensure_check(trade.id, &token_id, signal.confirm_ts, window.end_ts)
            .await?;
        info!(
            "Trade {}: cap check running over [{}, {}]",
            trade.id, signal.confirm_ts, window.end_ts
        );
        Ok(())
    }

    async fn handle_waiting_cap(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
        now: i64,
    ) -> Result<()> {
        let token_id = trade
            .token_id
            .clone()
            .unwrap_or_else(|| window.token_for(signal.direction).to_string());
        let check = self
            .cap_check
            .ensure_check(trade.id, &token_id, signal.confirm_ts, window.end_ts)
            .await?;

        let check = self.cap_check.evaluate(&check, now).await?;

        match check.status {
            CapStatus::Pass => {
                info!(
                    "Trade {}: entry validated ({} ticks at or under the cap)",
                    trade.id, check.consecutive_ticks
                );
                self.db
                    .transition(trade.id, TradeStatus::Ready, TradeUpdate::default())
                    .await?;
            }
            CapStatus::Fail => {
                self.cancel(trade, CancelReason::CapFail).await?;
            }
            CapStatus::Late => {
                self.cancel(trade, CancelReason::Late).await?;
            }
            CapStatus::Pending => {
                if now >= window.end_ts {
                    self.cancel(trade, CancelReason::CapFail).await?;
                }
            }
        }
        Ok(())
    }

    /// READY: day mode waits for the user (bounded by the response
    /// deadline); night mode auto-confirms when allowed. Approved trades are
    /// executed in place.
    async fn handle_ready(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
        now: i64,
        time_mode: TimeMode,
    ) -> Result<()> {
        if window.is_expired(now) {
            self.cancel(trade, CancelReason::Expired).await?;
            return Ok(());
        }

        match trade.decision {
            Decision::Ok | Decision::AutoOk => {
                return self.execute(trade, signal, window).await;
            }
            Decision::Skip | Decision::AutoSkip => return Ok(()),
            Decision::Pending => {}
        }

        match time_mode {
            TimeMode::Day => {
                match trade.approval_emitted_ts {
                    None => {
                        self.notifier.emit_approval(trade, signal, window).await;
                        self.db
                            .update_trade(
                                trade.id,
                                TradeUpdate {
                                    approval_emitted_ts: Some(now),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        info!("Trade {}: approval requested at {}", trade.id, now);
                    }
                    Some(emitted) => {
                        if now - emitted >= self.config.day_night.max_response_seconds {
                            info!(
                                "Trade {}: no response within {}s, auto-skipping",
                                trade.id, self.config.day_night.max_response_seconds
                            );
                            self.cancel(trade, CancelReason::Expired).await?;
                        }
                    }
                }
            }
            TimeMode::Night => {
                if !self.config.day_night.night_autotrade_enabled
                    || self.config.day_night.night_session_mode == NightSessionMode::Off
                {
                    info!("Trade {}: night trading disabled", trade.id);
                    self.cancel(trade, CancelReason::NightDisabled).await?;
                    return Ok(());
                }

                let stats = self.db.stats().await?;
                if stats.night_streak >= self.config.day_night.night_max_win_streak {
                    info!(
                        "Trade {}: night streak {} at the cap, closing the session",
                        trade.id, stats.night_streak
                    );
                    let reset = apply_night_session_reset(
                        stats,
                        self.config.day_night.night_session_mode,
                    );
                    self.db.update_stats(&reset).await?;
                    self.cancel(trade, CancelReason::NightDisabled).await?;
                    return Ok(());
                }

                let trade = self
                    .db
                    .update_trade(
                        trade.id,
                        TradeUpdate {
                            decision: Some(Decision::AutoOk),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!("Trade {}: auto-confirmed (night mode)", trade.id);
                return self.execute(&trade, signal, window).await;
            }
        }
        Ok(())
    }

    /// Place the order for an approved trade. Transient placement failures
    /// leave the trade in READY for the next cycle; a venue rejection walks
    /// the trade through ORDER_PLACED into ERROR.
    async fn execute(&self, trade: &Trade, signal: &Signal, window: &MarketWindow) -> Result<()> {
        let placed = match self.execution.place(trade, signal, window).await {
            Ok(placed) => placed,
            Err(e) => {
                if is_venue_rejection(&e) {
                    error!("Trade {}: order rejected at placement: {:#}", trade.id, e);
                    self.db
                        .transition(
                            trade.id,
                            TradeStatus::OrderPlaced,
                            TradeUpdate {
                                stake_amount: Some(self.execution.stake()),
                                fill_status: Some(FillStatus::Rejected),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.db
                        .transition(trade.id, TradeStatus::Error, TradeUpdate::default())
                        .await?;
                } else {
                    warn!(
                        "Trade {}: order placement failed, will retry: {:#}",
                        trade.id, e
                    );
                }
                return Ok(());
            }
        };

        let trade = self
            .db
            .transition(
                trade.id,
                TradeStatus::OrderPlaced,
                TradeUpdate {
                    order_id: Some(placed.order_id.clone()),
                    token_id: Some(placed.token_id.clone()),
                    stake_amount: Some(self.execution.stake()),
                    fill_status: Some(FillStatus::Pending),
                    ..Default::default()
                },
            )
            .await?;

        if placed.fill_status != FillStatus::Pending {
            self.db
                .update_trade(
                    trade.id,
                    TradeUpdate {
                        fill_status: Some(placed.fill_status),
                        fill_price: placed.fill_price,
                        ..Default::default()
                    },
                )
                .await?;
        }

        info!(
            "Trade {}: order {} placed (stake {})",
            trade.id,
            placed.order_id,
            self.execution.stake()
        );
        self.notifier
            .notify(&format!(
                "Order {} placed for {} ({})",
                placed.order_id, window.slug, signal.direction
            ))
            .await;
        Ok(())
    }

    /// ORDER_PLACED: track the fill, then resolve the window and settle.
    /// Settlement polls decay once the window has been over for a while and
    /// give up into ERROR only after the hard timeout.
    async fn handle_order_placed(
        &self,
        trade: &Trade,
        signal: &Signal,
        window: &MarketWindow,
        now: i64,
        cycle_id: u64,
    ) -> Result<()> {
        let mut trade = trade.clone();

        if trade.fill_status == FillStatus::Pending {
            match self.execution.poll_fill(&trade).await {
                Ok((fill_status, fill_price)) => {
                    if fill_status != trade.fill_status {
                        trade = self
                            .db
                            .update_trade(
                                trade.id,
                                TradeUpdate {
                                    fill_status: Some(fill_status),
                                    fill_price,
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                }
                Err(e) => {
                    warn!("Trade {}: fill poll failed: {:#}", trade.id, e);
                    return Ok(());
                }
            }
        }

        if matches!(
            trade.fill_status,
            FillStatus::Rejected | FillStatus::Cancelled
        ) {
            error!(
                "Trade {}: order {} ended {} without a fill",
                trade.id,
                trade.order_id.as_deref().unwrap_or("?"),
                trade.fill_status
            );
            self.db
                .transition(trade.id, TradeStatus::Error, TradeUpdate::default())
                .await?;
            return Ok(());
        }

        let outcome = match window.outcome {
            Some(outcome) => Some(outcome),
            None => {
                if now < window.end_ts {
                    return Ok(());
                }
                let elapsed = now - window.end_ts;
                if elapsed > SETTLEMENT_HARD_TIMEOUT_SECONDS {
                    error!(
                        "Trade {}: window {} unresolved {}s past its end",
                        trade.id, window.slug, elapsed
                    );
                    self.db
                        .transition(trade.id, TradeStatus::Error, TradeUpdate::default())
                        .await?;
                    return Ok(());
                }
                let should_poll = elapsed <= SETTLEMENT_FAST_WINDOW_SECONDS
                    || cycle_id % SETTLEMENT_SLOW_POLL_CYCLES == 0;
                if !should_poll {
                    return Ok(());
                }
                match self.catalog.resolved_outcome(window).await {
                    Ok(Some(outcome)) => {
                        self.db.set_window_outcome(window.id, outcome).await?;
                        Some(outcome)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Trade {}: outcome poll failed: {:#}", trade.id, e);
                        None
                    }
                }
            }
        };

        let Some(outcome) = outcome else {
            return Ok(());
        };

        if !trade.is_filled() {
            debug!(
                "Trade {}: window resolved but order still {}",
                trade.id, trade.fill_status
            );
            return Ok(());
        }

        let (is_win, pnl) = self.execution.settle(&trade, signal, outcome);
        let stats = self.db.stats().await?;
        let new_stats = self.stats.on_trade_settled(stats, &trade, is_win);
        self.db
            .settle_trade(trade.id, is_win, pnl, &new_stats)
            .await?;

        info!(
            "Trade {} settled: {} against {} (pnl {})",
            trade.id,
            if is_win { "WIN" } else { "LOSS" },
            outcome,
            pnl
        );
        self.notifier
            .notify(&format!(
                "Trade {} settled {} (pnl {})",
                trade.id,
                if is_win { "WIN" } else { "LOSS" },
                pnl
            ))
            .await;
        Ok(())
    }

    /// Cancel a trade with a reason. A PENDING decision becomes AUTO_SKIP;
    /// an explicit user decision is preserved.
    async fn cancel(&self, trade: &Trade, reason: CancelReason) -> Result<()> {
        let decision = if trade.decision == Decision::Pending {
            Some(Decision::AutoSkip)
        } else {
            None
        };
        self.db
            .transition(
                trade.id,
                TradeStatus::Cancelled,
                TradeUpdate {
                    cancel_reason: Some(reason),
                    decision,
                    ..Default::default()
                },
            )
            .await?;
        info!("Trade {} cancelled ({})", trade.id, reason);
        Ok(())
    }
}

/// A placement error that the venue itself refused (as opposed to a
/// transport failure worth retrying next cycle).
fn is_venue_rejection(error: &anyhow::Error) -> bool {
    if let Some(api) = error.downcast_ref::<ApiError>() {
        return !api.is_retryable();
    }
    error.to_string().to_lowercase().contains("rejected")
}
