//! Layered configuration for MARTIN
//!
//! Effective values resolve in order: settings table > environment > config
//! file > built-in defaults. Resolution is a pure function of those three
//! inputs; nothing here holds global mutable state.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::types::NightSessionMode;

/// Order execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(ExecutionMode::Paper),
            "live" => Ok(ExecutionMode::Live),
            other => anyhow::bail!("unknown execution mode: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// IANA zone used for DAY/NIGHT derivation
    pub timezone: String,
    pub database_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Zurich".to_string(),
            database_path: "data/martin.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub assets: Vec<String>,
    pub price_cap: Decimal,
    pub confirm_delay_seconds: i64,
    pub cap_min_ticks: i64,
    pub window_seconds: i64,
    /// Historical candle depth fetched ahead of each window
    pub warmup_seconds: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            assets: vec!["BTC".to_string(), "ETH".to_string()],
            price_cap: Decimal::new(55, 2),
            confirm_delay_seconds: 120,
            cap_min_ticks: 3,
            window_seconds: 3600,
            warmup_seconds: 7200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DayNightConfig {
    pub day_start_hour: u32,
    pub day_end_hour: u32,
    pub base_day_min_quality: f64,
    pub base_night_min_quality: f64,
    /// Wins needed before policy mode flips to STRICT
    pub switch_streak_at: i64,
    pub start_strict_after_n_wins: i64,
    pub strict_quality_increment: f64,
    pub night_max_win_streak: i64,
    pub night_autotrade_enabled: bool,
    pub night_session_mode: NightSessionMode,
    /// Day-mode approval deadline before auto-skip
    pub max_response_seconds: i64,
}

impl Default for DayNightConfig {
    fn default() -> Self {
        Self {
            day_start_hour: 8,
            day_end_hour: 22,
            base_day_min_quality: 35.0,
            base_night_min_quality: 35.0,
            switch_streak_at: 3,
            start_strict_after_n_wins: 3,
            strict_quality_increment: 5.0,
            night_max_win_streak: 5,
            night_autotrade_enabled: false,
            night_session_mode: NightSessionMode::Soft,
            max_response_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    /// Flat stake per trade, in USDC
    pub stake_amount: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            stake_amount: Decimal::from(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingQuantileConfig {
    /// When false, STRICT uses the incremental formula only
    pub enabled: bool,
    pub rolling_days: i64,
    pub max_samples: i64,
    pub min_samples: i64,
    pub strict_fallback_mult: f64,
    /// Quantile labels: p90 / p95 / p97 / p99
    pub day_quantile: String,
    pub night_quantile: String,
}

impl Default for RollingQuantileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rolling_days: 14,
            max_samples: 500,
            min_samples: 50,
            strict_fallback_mult: 1.25,
            day_quantile: "p95".to_string(),
            night_quantile: "p95".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiEndpointConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub retries: u32,
    pub backoff_factor: f64,
}

impl ApiEndpointConfig {
    fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_seconds: 30,
            retries: 3,
            backoff_factor: 2.0,
        }
    }
}

impl Default for ApiEndpointConfig {
    fn default() -> Self {
        Self::with_base_url("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApisConfig {
    pub gamma: ApiEndpointConfig,
    pub binance: ApiEndpointConfig,
    pub clob: ApiEndpointConfig,
}

impl Default for ApisConfig {
    fn default() -> Self {
        Self {
            gamma: ApiEndpointConfig::with_base_url("https://gamma-api.polymarket.com"),
            binance: ApiEndpointConfig::with_base_url("https://api.binance.com"),
            clob: ApiEndpointConfig::with_base_url("https://clob.polymarket.com"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Orchestration cycle period (P_TICK)
    pub tick_seconds: u64,
    /// Snapshot refresh period (P_SNAP)
    pub snapshot_seconds: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            snapshot_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

/// Full application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub trading: TradingConfig,
    pub day_night: DayNightConfig,
    pub execution: ExecutionConfig,
    pub rolling_quantile: RollingQuantileConfig,
    pub apis: ApisConfig,
    pub loops: LoopConfig,
    pub notifier: NotifierConfig,
}

impl Config {
    /// Load from a JSON file (missing file = defaults) and apply environment
    /// overrides. The settings-table overlay is applied separately once the
    /// database is open, via `apply_settings`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let default_path = Path::new("config/martin.json");
        let path = path.unwrap_or(default_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in config file {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the handful of deploy-time knobs.
    fn apply_env(&mut self) {
        if let Ok(db_path) = env::var("MARTIN_DB_PATH") {
            if !db_path.is_empty() {
                self.app.database_path = db_path;
            }
        }
        if let Ok(tz) = env::var("TIMEZONE") {
            if !tz.is_empty() {
                self.app.timezone = tz;
            }
        }
        if let Ok(mode) = env::var("EXECUTION_MODE") {
            if let Ok(mode) = mode.parse() {
                self.execution.mode = mode;
            }
        }
        if let Ok(url) = env::var("WEBHOOK_URL") {
            if !url.is_empty() {
                self.notifier.webhook_url = Some(url);
            }
        }
    }

    /// Overlay settings-table rows (dot-separated keys). Unknown keys and
    /// unparsable values are reported back to the caller.
    pub fn apply_settings(&mut self, settings: &HashMap<String, String>) -> Result<()> {
        for (key, value) in settings {
            self.apply_setting(key, value)
                .with_context(|| format!("invalid setting {} = {}", key, value))?;
        }
        self.validate()
    }

    fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "trading.price_cap" => self.trading.price_cap = Decimal::from_str(value)?,
            "trading.confirm_delay_seconds" => {
                self.trading.confirm_delay_seconds = value.parse()?
            }
            "trading.cap_min_ticks" => self.trading.cap_min_ticks = value.parse()?,
            "trading.window_seconds" => self.trading.window_seconds = value.parse()?,
            "trading.warmup_seconds" => self.trading.warmup_seconds = value.parse()?,
            "trading.assets" => {
                self.trading.assets = value
                    .split(',')
                    .map(|a| a.trim().to_uppercase())
                    .filter(|a| !a.is_empty())
                    .collect()
            }
            "day_night.day_start_hour" => self.day_night.day_start_hour = value.parse()?,
            "day_night.day_end_hour" => self.day_night.day_end_hour = value.parse()?,
            "day_night.base_day_min_quality" => {
                self.day_night.base_day_min_quality = value.parse()?
            }
            "day_night.base_night_min_quality" => {
                self.day_night.base_night_min_quality = value.parse()?
            }
            "day_night.switch_streak_at" => self.day_night.switch_streak_at = value.parse()?,
            "day_night.start_strict_after_n_wins" => {
                self.day_night.start_strict_after_n_wins = value.parse()?
            }
            "day_night.strict_quality_increment" => {
                self.day_night.strict_quality_increment = value.parse()?
            }
            "day_night.night_max_win_streak" => {
                self.day_night.night_max_win_streak = value.parse()?
            }
            "day_night.night_autotrade_enabled" => {
                self.day_night.night_autotrade_enabled = value.parse()?
            }
            "day_night.night_session_mode" => {
                self.day_night.night_session_mode = value.parse()?
            }
            "day_night.max_response_seconds" => {
                self.day_night.max_response_seconds = value.parse()?
            }
            "execution.mode" => self.execution.mode = value.parse()?,
            "execution.stake_amount" => self.execution.stake_amount = Decimal::from_str(value)?,
            "rolling_quantile.enabled" => self.rolling_quantile.enabled = value.parse()?,
            "rolling_quantile.rolling_days" => {
                self.rolling_quantile.rolling_days = value.parse()?
            }
            "rolling_quantile.max_samples" => self.rolling_quantile.max_samples = value.parse()?,
            "rolling_quantile.min_samples" => self.rolling_quantile.min_samples = value.parse()?,
            "rolling_quantile.strict_fallback_mult" => {
                self.rolling_quantile.strict_fallback_mult = value.parse()?
            }
            "loops.tick_seconds" => self.loops.tick_seconds = value.parse()?,
            "loops.snapshot_seconds" => self.loops.snapshot_seconds = value.parse()?,
            other => anyhow::bail!("unknown settings key: {}", other),
        }
        Ok(())
    }

    /// Parsed timezone for DAY/NIGHT derivation.
    pub fn timezone(&self) -> Result<Tz> {
        self.app
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid timezone: {}", self.app.timezone))
    }

    /// Startup validation; failures here are fatal for the process.
    pub fn validate(&self) -> Result<()> {
        if self.trading.assets.is_empty() {
            anyhow::bail!("trading.assets must not be empty");
        }
        if self.trading.price_cap <= Decimal::ZERO || self.trading.price_cap >= Decimal::ONE {
            anyhow::bail!("trading.price_cap must be in (0, 1)");
        }
        if self.trading.cap_min_ticks < 1 {
            anyhow::bail!("trading.cap_min_ticks must be >= 1");
        }
        if self.trading.confirm_delay_seconds < 0 {
            anyhow::bail!("trading.confirm_delay_seconds must be >= 0");
        }
        if self.day_night.day_start_hour > 23 || self.day_night.day_end_hour > 23 {
            anyhow::bail!("day_night hours must be in 0..=23");
        }
        if self.day_night.max_response_seconds <= 0 {
            anyhow::bail!("day_night.max_response_seconds must be positive");
        }
        if self.loops.tick_seconds == 0 || self.loops.snapshot_seconds == 0 {
            anyhow::bail!("loop periods must be positive");
        }
        self.timezone()?;
        Ok(())
    }
}
