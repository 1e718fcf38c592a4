//! Streak and policy engine
//!
//! Settlement drives streaks and the BASE/STRICT policy switch; only
//! taken-and-filled trades move anything. The acceptance threshold is a
//! pure function of config + stats, with an optional rolling-quantile
//! source for STRICT mode.

use anyhow::Result;
use tracing::{debug, info};

use crate::config::{DayNightConfig, RollingQuantileConfig};
use crate::db::Database;
use crate::types::{NightSessionMode, PolicyMode, Stats, TimeMode, Trade};

/// Type-7 interpolated quantile (the R/Excel default). `q` in [0, 1].
pub fn compute_quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() == 1 {
        return values[0];
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let h = (n - 1) as f64 * q;
    let k = h.floor() as usize;
    let d = h - k as f64;

    if k >= n - 1 {
        return sorted[n - 1];
    }
    sorted[k] + d * (sorted[k + 1] - sorted[k])
}

/// Fraction for a quantile label (p90/p95/p97/p99); unknown labels fall back
/// to p95.
pub fn quantile_fraction(label: &str) -> f64 {
    match label {
        "p90" => 0.90,
        "p95" => 0.95,
        "p97" => 0.97,
        "p99" => 0.99,
        _ => 0.95,
    }
}

/// Streak/policy engine over the ledger's stats singleton.
pub struct StatsService {
    db: Database,
    day_night: DayNightConfig,
    rolling: RollingQuantileConfig,
}

impl StatsService {
    pub fn new(db: Database, day_night: DayNightConfig, rolling: RollingQuantileConfig) -> Self {
        Self {
            db,
            day_night,
            rolling,
        }
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.db.stats().await
    }

    fn base_quality(&self, time_mode: TimeMode) -> f64 {
        match time_mode {
            TimeMode::Day => self.day_night.base_day_min_quality,
            TimeMode::Night => self.day_night.base_night_min_quality,
        }
    }

    /// Acceptance threshold for a signal right now. Pure in its inputs.
    ///
    /// BASE mode: the per-mode base quality. STRICT mode: the incremental
    /// formula `base + max(0, streak - start + 1) * increment`, unless the
    /// rolling-quantile source is enabled, in which case the last computed
    /// quantile threshold applies (falling back to `base * mult` until
    /// enough samples exist).
    pub fn acceptance_threshold(&self, stats: &Stats, time_mode: TimeMode) -> f64 {
        let base = self.base_quality(time_mode);

        if stats.policy_mode == PolicyMode::Base {
            return base;
        }

        if self.rolling.enabled {
            let stored = match time_mode {
                TimeMode::Day => stats.last_strict_day_threshold,
                TimeMode::Night => stats.last_strict_night_threshold,
            };
            return stored.unwrap_or(base * self.rolling.strict_fallback_mult);
        }

        let extra_wins =
            (stats.trade_level_streak - self.day_night.start_strict_after_n_wins + 1).max(0);
        base + extra_wins as f64 * self.day_night.strict_quality_increment
    }

    /// Fold a settlement into the stats. Pure; the caller persists the
    /// result atomically with the trade row.
    ///
    /// Trades that were not taken-and-filled leave everything unchanged.
    /// Wins bump the streaks and may flip policy to STRICT; the night-cap
    /// reset applies last, so a capped night session always lands back in
    /// BASE. Losses reset both streaks and the policy.
    pub fn on_trade_settled(&self, mut stats: Stats, trade: &Trade, is_win: bool) -> Stats {
        if !trade.counts_for_streak() {
            debug!(
                "Trade {} does not move streaks (decision={}, fill={})",
                trade.id, trade.decision, trade.fill_status
            );
            return stats;
        }

        stats.total_trades += 1;

        if is_win {
            stats.total_wins += 1;
            stats.trade_level_streak += 1;

            let night_trade = trade.time_mode == Some(TimeMode::Night);
            if night_trade {
                stats.night_streak += 1;
            }

            if stats.policy_mode == PolicyMode::Base
                && stats.trade_level_streak >= self.day_night.switch_streak_at
            {
                stats.policy_mode = PolicyMode::Strict;
                info!(
                    "Policy -> STRICT at streak {}",
                    stats.trade_level_streak
                );
            }

            if night_trade && stats.night_streak >= self.day_night.night_max_win_streak {
                info!(
                    "Night streak {} reached the cap, applying {} reset",
                    stats.night_streak, self.day_night.night_session_mode
                );
                stats = apply_night_session_reset(stats, self.day_night.night_session_mode);
            }
        } else {
            stats.total_losses += 1;
            info!(
                "Loss on trade {}: streaks reset (was {}/{})",
                trade.id, stats.trade_level_streak, stats.night_streak
            );
            stats.trade_level_streak = 0;
            stats.night_streak = 0;
            stats.policy_mode = PolicyMode::Base;
        }

        stats
    }

    /// Recompute the rolling STRICT thresholds from recent taken-and-filled
    /// trades, one per time mode. No-op when the rolling source is disabled.
    pub async fn update_rolling_quantiles(&self, now: i64) -> Result<Stats> {
        let mut stats = self.db.stats().await?;
        if !self.rolling.enabled {
            return Ok(stats);
        }

        let since_ts = now - self.rolling.rolling_days * 86_400;

        let day_values = self
            .db
            .filled_qualities(TimeMode::Day, since_ts, self.rolling.max_samples)
            .await?;
        stats.last_strict_day_threshold = Some(self.threshold_from_samples(
            &day_values,
            quantile_fraction(&self.rolling.day_quantile),
            self.day_night.base_day_min_quality,
        ));

        let night_values = self
            .db
            .filled_qualities(TimeMode::Night, since_ts, self.rolling.max_samples)
            .await?;
        stats.last_strict_night_threshold = Some(self.threshold_from_samples(
            &night_values,
            quantile_fraction(&self.rolling.night_quantile),
            self.day_night.base_night_min_quality,
        ));

        stats.last_quantile_update_ts = Some(now);
        self.db.update_stats(&stats).await?;

        info!(
            "Rolling thresholds updated: day={:?} ({} samples), night={:?} ({} samples)",
            stats.last_strict_day_threshold,
            day_values.len(),
            stats.last_strict_night_threshold,
            night_values.len()
        );
        Ok(stats)
    }

    fn threshold_from_samples(&self, values: &[f64], q: f64, base: f64) -> f64 {
        if (values.len() as i64) < self.rolling.min_samples {
            return base * self.rolling.strict_fallback_mult;
        }
        compute_quantile(values, q)
    }
}

/// Night-session reset applied once the night win cap is hit. OFF never
/// fires (night trading is refused earlier), SOFT clears only the night
/// streak, HARD clears both streaks. Policy returns to BASE either way.
pub fn apply_night_session_reset(mut stats: Stats, mode: NightSessionMode) -> Stats {
    match mode {
        NightSessionMode::Off => stats,
        NightSessionMode::Soft => {
            stats.night_streak = 0;
            stats.policy_mode = PolicyMode::Base;
            stats
        }
        NightSessionMode::Hard => {
            stats.night_streak = 0;
            stats.trade_level_streak = 0;
            stats.policy_mode = PolicyMode::Base;
            stats
        }
    }
}
