//! Core domain types for the MARTIN trading assistant

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trade direction / market outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            other => anyhow::bail!("unknown direction: {}", other),
        }
    }
}

/// Quality-threshold regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyMode {
    Base,
    Strict,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Base => write!(f, "BASE"),
            PolicyMode::Strict => write!(f, "STRICT"),
        }
    }
}

impl FromStr for PolicyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BASE" => Ok(PolicyMode::Base),
            "STRICT" => Ok(PolicyMode::Strict),
            other => anyhow::bail!("unknown policy mode: {}", other),
        }
    }
}

/// Day/Night mode derived from the configured local timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeMode {
    Day,
    Night,
}

impl fmt::Display for TimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeMode::Day => write!(f, "DAY"),
            TimeMode::Night => write!(f, "NIGHT"),
        }
    }
}

impl FromStr for TimeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DAY" => Ok(TimeMode::Day),
            "NIGHT" => Ok(TimeMode::Night),
            other => anyhow::bail!("unknown time mode: {}", other),
        }
    }
}

/// Trade lifecycle status
///
/// NEW -> SEARCHING_SIGNAL -> SIGNALLED -> WAITING_CONFIRM -> WAITING_CAP
///     -> READY -> ORDER_PLACED -> SETTLED
/// CANCELLED and ERROR are terminal alongside SETTLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    New,
    SearchingSignal,
    Signalled,
    WaitingConfirm,
    WaitingCap,
    Ready,
    OrderPlaced,
    Settled,
    Cancelled,
    Error,
}

impl TradeStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Settled | TradeStatus::Cancelled | TradeStatus::Error
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::New => "NEW",
            TradeStatus::SearchingSignal => "SEARCHING_SIGNAL",
            TradeStatus::Signalled => "SIGNALLED",
            TradeStatus::WaitingConfirm => "WAITING_CONFIRM",
            TradeStatus::WaitingCap => "WAITING_CAP",
            TradeStatus::Ready => "READY",
            TradeStatus::OrderPlaced => "ORDER_PLACED",
            TradeStatus::Settled => "SETTLED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TradeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(TradeStatus::New),
            "SEARCHING_SIGNAL" => Ok(TradeStatus::SearchingSignal),
            "SIGNALLED" => Ok(TradeStatus::Signalled),
            "WAITING_CONFIRM" => Ok(TradeStatus::WaitingConfirm),
            "WAITING_CAP" => Ok(TradeStatus::WaitingCap),
            "READY" => Ok(TradeStatus::Ready),
            "ORDER_PLACED" => Ok(TradeStatus::OrderPlaced),
            "SETTLED" => Ok(TradeStatus::Settled),
            "CANCELLED" => Ok(TradeStatus::Cancelled),
            "ERROR" => Ok(TradeStatus::Error),
            other => anyhow::bail!("unknown trade status: {}", other),
        }
    }
}

/// CAP check verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapStatus {
    Pending,
    Pass,
    Fail,
    /// confirm_ts >= end_ts: the check could never have run
    Late,
}

impl fmt::Display for CapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapStatus::Pending => "PENDING",
            CapStatus::Pass => "PASS",
            CapStatus::Fail => "FAIL",
            CapStatus::Late => "LATE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CapStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(CapStatus::Pending),
            "PASS" => Ok(CapStatus::Pass),
            "FAIL" => Ok(CapStatus::Fail),
            "LATE" => Ok(CapStatus::Late),
            other => anyhow::bail!("unknown cap status: {}", other),
        }
    }
}

/// Order fill status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillStatus {
    Pending,
    Filled,
    Partial,
    Rejected,
    Cancelled,
}

impl fmt::Display for FillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FillStatus::Pending => "PENDING",
            FillStatus::Filled => "FILLED",
            FillStatus::Partial => "PARTIAL",
            FillStatus::Rejected => "REJECTED",
            FillStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FillStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(FillStatus::Pending),
            "FILLED" => Ok(FillStatus::Filled),
            "PARTIAL" => Ok(FillStatus::Partial),
            "REJECTED" => Ok(FillStatus::Rejected),
            "CANCELLED" => Ok(FillStatus::Cancelled),
            other => anyhow::bail!("unknown fill status: {}", other),
        }
    }
}

/// User or policy decision on a READY trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pending,
    /// User confirmed (day mode)
    Ok,
    /// Policy auto-confirmed (night mode)
    AutoOk,
    /// User skipped (day mode)
    Skip,
    /// Auto-skipped (timeout, cancellation, pause)
    AutoSkip,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Pending => "PENDING",
            Decision::Ok => "OK",
            Decision::AutoOk => "AUTO_OK",
            Decision::Skip => "SKIP",
            Decision::AutoSkip => "AUTO_SKIP",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Decision::Pending),
            "OK" => Ok(Decision::Ok),
            "AUTO_OK" => Ok(Decision::AutoOk),
            "SKIP" => Ok(Decision::Skip),
            "AUTO_SKIP" => Ok(Decision::AutoSkip),
            other => anyhow::bail!("unknown decision: {}", other),
        }
    }
}

/// Why a trade ended up CANCELLED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    NoSignal,
    LowQuality,
    Skip,
    Expired,
    Late,
    CapFail,
    Paused,
    NightDisabled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::NoSignal => "NO_SIGNAL",
            CancelReason::LowQuality => "LOW_QUALITY",
            CancelReason::Skip => "SKIP",
            CancelReason::Expired => "EXPIRED",
            CancelReason::Late => "LATE",
            CancelReason::CapFail => "CAP_FAIL",
            CancelReason::Paused => "PAUSED",
            CancelReason::NightDisabled => "NIGHT_DISABLED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CancelReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NO_SIGNAL" => Ok(CancelReason::NoSignal),
            "LOW_QUALITY" => Ok(CancelReason::LowQuality),
            "SKIP" => Ok(CancelReason::Skip),
            "EXPIRED" => Ok(CancelReason::Expired),
            "LATE" => Ok(CancelReason::Late),
            "CAP_FAIL" => Ok(CancelReason::CapFail),
            "PAUSED" => Ok(CancelReason::Paused),
            "NIGHT_DISABLED" => Ok(CancelReason::NightDisabled),
            other => anyhow::bail!("unknown cancel reason: {}", other),
        }
    }
}

/// Overnight session behavior after the night win-streak cap is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NightSessionMode {
    /// Night autotrade disabled outright
    Off,
    /// Reset only night_streak
    Soft,
    /// Reset night_streak and trade_level_streak
    Hard,
}

impl fmt::Display for NightSessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NightSessionMode::Off => "OFF",
            NightSessionMode::Soft => "SOFT",
            NightSessionMode::Hard => "HARD",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NightSessionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OFF" => Ok(NightSessionMode::Off),
            "SOFT" => Ok(NightSessionMode::Soft),
            "HARD" => Ok(NightSessionMode::Hard),
            other => anyhow::bail!("unknown night session mode: {}", other),
        }
    }
}

/// An hourly up/down market window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketWindow {
    pub id: i64,
    pub asset: String,
    pub slug: String,
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    /// Window start (unix seconds, UTC)
    pub start_ts: i64,
    /// Window end / resolution time (unix seconds, UTC)
    pub end_ts: i64,
    /// Resolved outcome; None until settlement, then fixed
    pub outcome: Option<Direction>,
    pub created_at: DateTime<Utc>,
}

impl MarketWindow {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.end_ts
    }

    pub fn time_remaining(&self, now: i64) -> i64 {
        (self.end_ts - now).max(0)
    }

    /// Token id backing the given direction.
    pub fn token_for(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up_token_id,
            Direction::Down => &self.down_token_id,
        }
    }
}

/// Component breakdown behind a signal's quality score.
///
/// The orchestrator treats this as opaque; it is produced by the TA engine
/// and persisted alongside the signal for later inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub anchor_price: f64,
    pub signal_price: f64,
    pub ret_from_anchor: f64,
    pub anchor_component: f64,
    pub adx_value: f64,
    pub adx_component: f64,
    pub ema50_slope: f64,
    pub slope_component: f64,
    pub trend_mult: f64,
    pub trend_confirms: bool,
    pub final_quality: f64,
}

/// A qualifying TA detection attached to a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub window_id: i64,
    pub direction: Direction,
    /// When the signal bar closed (unix seconds)
    pub signal_ts: i64,
    /// signal_ts + confirm_delay_seconds
    pub confirm_ts: i64,
    pub quality: f64,
    pub breakdown: QualityBreakdown,
    pub anchor_bar_ts: i64,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle record for (at most) one trade per window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub window_id: i64,
    pub signal_id: Option<i64>,
    pub status: TradeStatus,
    pub time_mode: Option<TimeMode>,
    pub policy_mode: PolicyMode,
    pub decision: Decision,
    pub cancel_reason: Option<CancelReason>,
    pub token_id: Option<String>,
    pub order_id: Option<String>,
    pub fill_status: FillStatus,
    pub fill_price: Option<Decimal>,
    pub stake_amount: Decimal,
    pub pnl: Option<Decimal>,
    pub is_win: Option<bool>,
    /// Streak snapshots at trade creation
    pub trade_level_streak: i64,
    pub night_streak: i64,
    /// When the day-mode approval card was first emitted (unix seconds)
    pub approval_emitted_ts: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// Taken means the decision was an explicit or automatic OK.
    pub fn is_taken(&self) -> bool {
        matches!(self.decision, Decision::Ok | Decision::AutoOk)
    }

    /// PARTIAL fills count as filled for streak purposes.
    pub fn is_filled(&self) -> bool {
        matches!(self.fill_status, FillStatus::Filled | FillStatus::Partial)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Only taken-and-filled trades move streaks.
    pub fn counts_for_streak(&self) -> bool {
        self.is_taken() && self.is_filled()
    }
}

/// One CAP evaluation record per trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapCheck {
    pub id: i64,
    pub trade_id: i64,
    pub token_id: String,
    pub confirm_ts: i64,
    pub end_ts: i64,
    pub status: CapStatus,
    pub consecutive_ticks: i64,
    pub first_pass_ts: Option<i64>,
    pub price_at_pass: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Global counters and policy state (singleton row, id = 1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub trade_level_streak: i64,
    pub night_streak: i64,
    pub policy_mode: PolicyMode,
    pub total_trades: i64,
    pub total_wins: i64,
    pub total_losses: i64,
    pub last_strict_day_threshold: Option<f64>,
    pub last_strict_night_threshold: Option<f64>,
    pub last_quantile_update_ts: Option<i64>,
    pub is_paused: bool,
    pub day_only: bool,
    pub night_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl Stats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.total_wins as f64 / self.total_trades as f64 * 100.0
    }
}

/// OHLCV candle (unix-second open time)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle interval supported by the candle source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            CandleInterval::OneMinute => 60,
            CandleInterval::FiveMinutes => 300,
        }
    }
}

/// A single order-book price observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub ts: i64,
    pub price: Decimal,
}

/// A user decision delivered through the decision channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDecision {
    pub trade_id: i64,
    pub approve: bool,
}
