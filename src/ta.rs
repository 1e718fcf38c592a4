//! Technical-analysis engine
//!
//! EMA20 crossover detection on 1m candles plus a fixed-weight quality
//! score. The orchestrator only sees the `SignalOracle` trait: candles in,
//! an optional `(direction, signal_ts, quality, breakdown)` out. It never
//! interprets the breakdown.

use crate::types::{Candle, Direction, MarketWindow, QualityBreakdown};

// Fixed scoring constants.
const ANCHOR_SCALE: f64 = 10_000.0;
const W_ANCHOR: f64 = 1.0;
const W_ADX: f64 = 0.2;
const W_SLOPE: f64 = 0.2;
const TREND_BONUS: f64 = 1.10;
const TREND_PENALTY: f64 = 0.70;
const TREND_NEUTRAL: f64 = 1.00;
const ADX_PERIOD: usize = 14;
const EMA50_SLOPE_BARS: usize = 6;

/// A detection produced by the oracle. `confirm_ts` is derived by the
/// orchestrator as `signal_ts + confirm_delay_seconds`.
#[derive(Debug, Clone)]
pub struct TaSignal {
    pub direction: Direction,
    pub signal_ts: i64,
    pub quality: f64,
    pub breakdown: QualityBreakdown,
    pub anchor_bar_ts: i64,
}

/// Capability the orchestrator programs against. Pure: equivalent inputs
/// yield equivalent outputs.
pub trait SignalOracle: Send + Sync {
    fn evaluate(
        &self,
        window: &MarketWindow,
        now: i64,
        candles_1m: &[Candle],
        candles_5m: &[Candle],
    ) -> Option<TaSignal>;
}

/// Exponential moving average over `values`.
///
/// Entries before the first full period are zero; the first EMA value is the
/// SMA of the initial period, matching the indicator's standard seeding.
pub fn compute_ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 || values.len() < period {
        return vec![0.0; values.len()];
    }

    let mut ema = vec![0.0; period - 1];
    let multiplier = 2.0 / (period as f64 + 1.0);

    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    ema.push(sma);

    for i in period..values.len() {
        let prev = ema[i - 1];
        ema.push((values[i] - prev) * multiplier + prev);
    }
    ema
}

/// Average Directional Index with Wilder smoothing.
pub fn compute_adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || n < period * 2 {
        return vec![0.0; n];
    }

    let mut tr = vec![0.0; n];
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];

    for i in 1..n {
        let range = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        tr[i] = range;

        let up_move = highs[i] - highs[i - 1];
        let down_move = lows[i - 1] - lows[i];
        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    // Wilder's running sum: seed with the first `period` values, then decay.
    let wilder = |values: &[f64]| -> Vec<f64> {
        let mut smoothed = vec![0.0; values.len()];
        if values.len() <= period {
            return smoothed;
        }
        smoothed[period] = values[1..=period].iter().sum();
        for i in period + 1..values.len() {
            smoothed[i] = smoothed[i - 1] - smoothed[i - 1] / period as f64 + values[i];
        }
        smoothed
    };

    let atr = wilder(&tr);
    let smoothed_plus = wilder(&plus_dm);
    let smoothed_minus = wilder(&minus_dm);

    let mut plus_di = vec![0.0; n];
    let mut minus_di = vec![0.0; n];
    for i in period..n {
        if atr[i] != 0.0 {
            plus_di[i] = 100.0 * smoothed_plus[i] / atr[i];
            minus_di[i] = 100.0 * smoothed_minus[i] / atr[i];
        }
    }

    let mut dx = vec![0.0; n];
    for i in period..n {
        let di_sum = plus_di[i] + minus_di[i];
        if di_sum != 0.0 {
            dx[i] = 100.0 * (plus_di[i] - minus_di[i]).abs() / di_sum;
        }
    }

    let mut adx = vec![0.0; n];
    let start = period * 2 - 1;
    if start < n {
        adx[start] = dx[period..=start].iter().sum::<f64>() / period as f64;
        for i in start + 1..n {
            adx[i] = (adx[i - 1] * (period as f64 - 1.0) + dx[i]) / period as f64;
        }
    }
    adx
}

#[derive(Debug, Clone, Copy)]
struct Detection {
    direction: Direction,
    signal_ts: i64,
    signal_price: f64,
    anchor_bar_ts: i64,
    anchor_price: f64,
    signal_idx: usize,
}

/// EMA20 crossover detector + fixed-weight quality scorer.
#[derive(Debug, Default, Clone)]
pub struct TaEngine;

impl TaEngine {
    pub fn new() -> Self {
        Self
    }

    /// Scan 1m candles from the window's anchor bar for the first confirmed
    /// EMA20 crossover at or before `now`.
    ///
    /// UP: two consecutive closes above EMA20 after a bar below it.
    /// DOWN: mirrored. Evaluated at candle close only.
    fn detect(&self, candles_1m: &[Candle], start_ts: i64, now: i64) -> Option<Detection> {
        // EMA20 needs 20 bars plus 3 for the crossover pattern.
        if candles_1m.len() < 23 {
            return None;
        }

        let closes: Vec<f64> = candles_1m.iter().map(|c| c.close).collect();
        let ema20 = compute_ema(&closes, 20);

        let anchor_idx = candles_1m.iter().position(|c| c.t >= start_ts)?;
        if anchor_idx + 2 >= candles_1m.len() {
            return None;
        }
        let anchor = candles_1m[anchor_idx];

        for i in (anchor_idx + 2).max(2)..candles_1m.len() {
            let bar = candles_1m[i];
            if bar.t > now {
                break;
            }
            let prior = candles_1m[i - 1];
            let crossover = candles_1m[i - 2];
            let (ema_bar, ema_prior, ema_cross) = (ema20[i], ema20[i - 1], ema20[i - 2]);
            if ema_bar == 0.0 || ema_prior == 0.0 || ema_cross == 0.0 {
                continue;
            }

            let up = bar.close > ema_bar && prior.close > ema_prior && crossover.close < ema_cross;
            let down =
                bar.close < ema_bar && prior.close < ema_prior && crossover.close > ema_cross;

            if up || down {
                return Some(Detection {
                    direction: if up { Direction::Up } else { Direction::Down },
                    signal_ts: bar.t,
                    signal_price: bar.close,
                    anchor_bar_ts: anchor.t,
                    anchor_price: anchor.close,
                    signal_idx: i,
                });
            }
        }
        None
    }

    /// Score a detection:
    /// `(anchor·1.0 + adx·0.2 + slope·0.2) × trend_mult`, trend from EMA20
    /// agreement on 5m candles.
    fn quality(
        &self,
        detection: &Detection,
        candles_1m: &[Candle],
        candles_5m: &[Candle],
    ) -> QualityBreakdown {
        let mut breakdown = QualityBreakdown {
            anchor_price: detection.anchor_price,
            signal_price: detection.signal_price,
            trend_mult: TREND_NEUTRAL,
            trend_confirms: true,
            ..Default::default()
        };

        let ret_from_anchor =
            (detection.signal_price - detection.anchor_price) / detection.anchor_price;
        breakdown.ret_from_anchor = ret_from_anchor;
        let anchor_component = ret_from_anchor.abs() * ANCHOR_SCALE;
        breakdown.anchor_component = anchor_component;

        let highs: Vec<f64> = candles_1m.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles_1m.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles_1m.iter().map(|c| c.close).collect();

        let adx_values = compute_adx(&highs, &lows, &closes, ADX_PERIOD);
        let adx_raw = adx_values.get(detection.signal_idx).copied().unwrap_or(0.0);
        breakdown.adx_value = adx_raw;
        let adx_component = (adx_raw / 100.0).min(1.0);
        breakdown.adx_component = adx_component;

        let ema50 = compute_ema(&closes, 50);
        let mut slope_component = 0.0;
        if detection.signal_idx >= EMA50_SLOPE_BARS && detection.signal_idx < ema50.len() {
            let now_val = ema50[detection.signal_idx];
            let prev_val = ema50[detection.signal_idx - EMA50_SLOPE_BARS];
            let slope = now_val - prev_val;
            breakdown.ema50_slope = slope;
            if prev_val != 0.0 {
                // 1% move over the slope window saturates the component.
                slope_component = ((slope / prev_val).abs() * 100.0).min(1.0);
            }
        }
        breakdown.slope_component = slope_component;

        if !candles_5m.is_empty() {
            let idx5 = candles_5m
                .iter()
                .rposition(|c| c.t <= detection.signal_ts)
                .unwrap_or(candles_5m.len() - 1);
            let closes_5m: Vec<f64> = candles_5m.iter().map(|c| c.close).collect();
            let ema20_5m = compute_ema(&closes_5m, 20);
            if idx5 < ema20_5m.len() && ema20_5m[idx5] != 0.0 {
                let confirms = match detection.direction {
                    Direction::Up => closes_5m[idx5] > ema20_5m[idx5],
                    Direction::Down => closes_5m[idx5] < ema20_5m[idx5],
                };
                breakdown.trend_confirms = confirms;
                breakdown.trend_mult = if confirms { TREND_BONUS } else { TREND_PENALTY };
            }
        }

        let base = W_ANCHOR * anchor_component + W_ADX * adx_component + W_SLOPE * slope_component;
        breakdown.final_quality = base * breakdown.trend_mult;
        breakdown
    }
}

impl SignalOracle for TaEngine {
    fn evaluate(
        &self,
        window: &MarketWindow,
        now: i64,
        candles_1m: &[Candle],
        candles_5m: &[Candle],
    ) -> Option<TaSignal> {
        let detection = self.detect(candles_1m, window.start_ts, now)?;
        let breakdown = self.quality(&detection, candles_1m, candles_5m);
        Some(TaSignal {
            direction: detection.direction,
            signal_ts: detection.signal_ts,
            quality: breakdown.final_quality,
            breakdown,
            anchor_bar_ts: detection.anchor_bar_ts,
        })
    }
}
