//! Snapshot worker and per-asset TA cache
//!
//! Keeps candle context fresh for every configured asset, independently of
//! market windows. Each cache entry is an immutable `Arc`-held triple of
//! 1m candles, 5m candles and fetch time, swapped atomically on refresh so
//! readers never see a torn view.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::clients::CandleSource;
use crate::types::{Candle, CandleInterval};

/// A snapshot is considered fresh within this many seconds of its fetch.
pub const FRESHNESS_SECONDS: i64 = 120;

/// Retained candle depth per asset.
const MAX_1M_CANDLES: usize = 240;
const MAX_5M_CANDLES: usize = 48;

/// Immutable candle context for one asset.
#[derive(Debug)]
pub struct Snapshot {
    pub asset: String,
    pub candles_1m: Vec<Candle>,
    pub candles_5m: Vec<Candle>,
    /// Unix seconds of the successful fetch
    pub fetched_at: i64,
}

impl Snapshot {
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.fetched_at < FRESHNESS_SECONDS
    }
}

/// Read-heavy cache of per-asset snapshots. Writes replace whole entries;
/// readers clone the `Arc` and work on an immutable view.
#[derive(Clone, Default)]
pub struct SnapshotCache {
    snapshots: Arc<RwLock<HashMap<String, Arc<Snapshot>>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, asset: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.read().await.get(asset).cloned()
    }

    /// Fresh snapshot or None; stale entries are left in place for the next
    /// refresh but not handed out.
    pub async fn get_fresh(&self, asset: &str, now: i64) -> Option<Arc<Snapshot>> {
        self.get(asset).await.filter(|snapshot| snapshot.is_fresh(now))
    }

    pub async fn update(
        &self,
        asset: &str,
        mut candles_1m: Vec<Candle>,
        mut candles_5m: Vec<Candle>,
        fetched_at: i64,
    ) {
        if candles_1m.len() > MAX_1M_CANDLES {
            candles_1m.drain(..candles_1m.len() - MAX_1M_CANDLES);
        }
        if candles_5m.len() > MAX_5M_CANDLES {
            candles_5m.drain(..candles_5m.len() - MAX_5M_CANDLES);
        }
        let snapshot = Arc::new(Snapshot {
            asset: asset.to_string(),
            candles_1m,
            candles_5m,
            fetched_at,
        });
        self.snapshots
            .write()
            .await
            .insert(asset.to_string(), snapshot);
    }

    pub async fn assets(&self) -> Vec<String> {
        self.snapshots.read().await.keys().cloned().collect()
    }
}

/// Background loop refreshing the cache every `period`.
pub struct SnapshotWorker {
    candles: Arc<dyn CandleSource>,
    cache: SnapshotCache,
    assets: Vec<String>,
    warmup_seconds: i64,
    period: Duration,
}

impl SnapshotWorker {
    pub fn new(
        candles: Arc<dyn CandleSource>,
        cache: SnapshotCache,
        assets: Vec<String>,
        warmup_seconds: i64,
        period: Duration,
    ) -> Self {
        Self {
            candles,
            cache,
            assets,
            warmup_seconds,
            period,
        }
    }

    /// Run until the shutdown flag flips. Missed ticks are coalesced so a
    /// slow refresh never causes a burst of catch-up fetches.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Snapshot worker started for {:?} (every {:?})",
            self.assets, self.period
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    self.refresh_all(now).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Snapshot worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Refresh every asset once. Per-asset failures are logged and leave
    /// the previous snapshot in place; one asset never blocks another.
    pub async fn refresh_all(&self, now: i64) {
        for asset in &self.assets {
            if let Err(e) = self.refresh_asset(asset, now).await {
                warn!("Snapshot refresh failed for {}: {:#}", asset, e);
            }
        }
    }

    async fn refresh_asset(&self, asset: &str, now: i64) -> Result<()> {
        let from_ts = now - self.warmup_seconds;
        let (candles_1m, candles_5m) = tokio::try_join!(
            self.candles
                .candles(asset, CandleInterval::OneMinute, from_ts, now),
            self.candles
                .candles(asset, CandleInterval::FiveMinutes, from_ts, now),
        )?;

        self.cache.update(asset, candles_1m, candles_5m, now).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;

    fn candle(t: i64) -> Candle {
        Candle {
            t,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        }
    }

    struct FakeSource {
        fail_asset: Option<String>,
    }

    #[async_trait]
    impl CandleSource for FakeSource {
        async fn candles(
            &self,
            asset: &str,
            interval: CandleInterval,
            from_ts: i64,
            to_ts: i64,
        ) -> Result<Vec<Candle>> {
            if self.fail_asset.as_deref() == Some(asset) {
                return Err(anyhow!("venue unavailable"));
            }
            let step = interval.seconds();
            Ok((from_ts..to_ts).step_by(step as usize).map(candle).collect())
        }
    }

    fn worker(fail_asset: Option<&str>) -> SnapshotWorker {
        SnapshotWorker::new(
            Arc::new(FakeSource {
                fail_asset: fail_asset.map(String::from),
            }),
            SnapshotCache::new(),
            vec!["BTC".to_string(), "ETH".to_string()],
            7200,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn refresh_populates_bounded_snapshots() {
        let worker = worker(None);
        let now = 1_000_000;
        worker.refresh_all(now).await;

        let snapshot = worker.cache.get("BTC").await.unwrap();
        assert_eq!(snapshot.fetched_at, now);
        // 7200s of 1m candles is 120 rows, under the bound; the 5m side is
        // 24 rows.
        assert_eq!(snapshot.candles_1m.len(), 120);
        assert_eq!(snapshot.candles_5m.len(), 24);
        assert!(snapshot.is_fresh(now + FRESHNESS_SECONDS - 1));
        assert!(!snapshot.is_fresh(now + FRESHNESS_SECONDS));
    }

    #[tokio::test]
    async fn cache_bounds_oversized_histories() {
        let cache = SnapshotCache::new();
        let candles_1m: Vec<Candle> = (0..500).map(|i| candle(i * 60)).collect();
        let candles_5m: Vec<Candle> = (0..100).map(|i| candle(i * 300)).collect();
        cache.update("BTC", candles_1m, candles_5m, 1_000_000).await;

        let snapshot = cache.get("BTC").await.unwrap();
        assert_eq!(snapshot.candles_1m.len(), MAX_1M_CANDLES);
        assert_eq!(snapshot.candles_5m.len(), MAX_5M_CANDLES);
        // The newest candles are the ones retained.
        assert_eq!(snapshot.candles_1m.last().unwrap().t, 499 * 60);
    }

    #[tokio::test]
    async fn one_failing_asset_does_not_block_others() {
        let worker = worker(Some("BTC"));
        worker.refresh_all(1_000_000).await;

        assert!(worker.cache.get("BTC").await.is_none());
        assert!(worker.cache.get("ETH").await.is_some());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let cache = SnapshotCache::new();
        cache.update("BTC", vec![candle(1)], vec![candle(1)], 900_000).await;

        let worker = SnapshotWorker::new(
            Arc::new(FakeSource {
                fail_asset: Some("BTC".to_string()),
            }),
            cache.clone(),
            vec!["BTC".to_string()],
            7200,
            Duration::from_secs(30),
        );
        worker.refresh_all(1_000_000).await;

        // The stale snapshot survives; consumers see it as stale.
        let snapshot = cache.get("BTC").await.unwrap();
        assert_eq!(snapshot.fetched_at, 900_000);
        assert!(cache.get_fresh("BTC", 1_000_000).await.is_none());
    }
}
