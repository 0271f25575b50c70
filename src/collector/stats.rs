use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    health::WorkerKind,
    metrics::{METRICS, RuntimeMetrics},
    schema::StatsSnapshot,
};

use super::{RestartReason, Worker, WorkerContext};

/// Periodic statistics snapshots for the current target.
///
/// Every tick stands alone: it resolves the target, fetches one sample and
/// appends one row. A failed tick is logged and skipped; nothing carries
/// over to the next one.
pub struct StatsCollector {
    ctx: WorkerContext,
    restarts: mpsc::Receiver<RestartReason>,
    every: Duration,
    /// Last `captured_at` written per broadcast.
    last_captured: HashMap<String, DateTime<Utc>>,
}

impl StatsCollector {
    pub fn new(ctx: WorkerContext, restarts: mpsc::Receiver<RestartReason>, every: Duration) -> Self {
        Self {
            ctx,
            restarts,
            every,
            last_captured: HashMap::new(),
        }
    }

    /// One snapshot cycle. Returns whether a row was written.
    pub async fn tick(&mut self) -> bool {
        let target = self.ctx.resolver.resolve().await;
        let Some(broadcast_id) = self.ctx.feed.broadcast_id(&target) else {
            RuntimeMetrics::incr(&METRICS.stats_failures);
            warn!("[stats] target {target:?} does not name a broadcast, skipping tick");
            return false;
        };

        let feed = &self.ctx.feed;
        let sample = match self
            .ctx
            .retry
            .run("fetch stats", || feed.fetch_stats(&target))
            .await
        {
            Ok(sample) => sample,
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.stats_failures);
                warn!("[stats] skipping tick for {broadcast_id}: {e}");
                return false;
            }
        };

        let captured_at = self.next_captured_at(&broadcast_id, Utc::now());
        let snapshot = StatsSnapshot::from_sample(broadcast_id, captured_at, sample);

        let store = &self.ctx.store;
        match self
            .ctx
            .retry
            .run("store stats snapshot", || store.insert_snapshot(&snapshot))
            .await
        {
            Ok(()) => {
                RuntimeMetrics::incr(&METRICS.stats_snapshots);
                self.ctx.health.touch(WorkerKind::Stats);
                debug!(
                    "[stats] {} viewers={:?} views={:?} likes={:?}",
                    snapshot.broadcast_id,
                    snapshot.concurrent_viewers,
                    snapshot.view_count,
                    snapshot.like_count
                );
                true
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.stats_failures);
                warn!("[stats] dropping snapshot for {}: {e}", snapshot.broadcast_id);
                false
            }
        }
    }

    /// `now`, bumped if needed so `captured_at` strictly increases per
    /// broadcast (microsecond resolution, as stored).
    fn next_captured_at(&mut self, broadcast_id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last_captured.get(broadcast_id) {
            Some(prev) if now <= *prev => *prev + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_captured.insert(broadcast_id.to_string(), at);
        at
    }
}

#[async_trait::async_trait]
impl Worker for StatsCollector {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Stats
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                reason = self.restarts.recv() => match reason {
                    Some(reason) => {
                        info!("[stats] restart ({reason:?}), snapshotting fresh target now");
                        ticker.reset();
                        self.tick().await;
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::time::sleep;

    use crate::health::WorkerHealth;
    use crate::retry::RetryPolicy;
    use crate::target::TargetResolver;
    use crate::testing::{MemoryStore, ScriptedFeed};

    fn collector(
        store: &Arc<MemoryStore>,
        feed: &Arc<ScriptedFeed>,
        restarts: mpsc::Receiver<RestartReason>,
    ) -> StatsCollector {
        let ctx = WorkerContext {
            store: store.clone(),
            feed: feed.clone(),
            resolver: TargetResolver::new(store.clone(), "youtube_url", "streamA"),
            health: Arc::new(WorkerHealth::new()),
            retry: RetryPolicy::new(2, Duration::from_secs(1)),
        };
        StatsCollector::new(ctx, restarts, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn tick_persists_snapshot_for_resolved_target() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut stats = collector(&store, &feed, rx);

        assert!(stats.tick().await);

        let rows = store.snapshots();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].broadcast_id, "streamA");
        assert_eq!(rows[0].concurrent_viewers, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_is_skipped_and_next_tick_proceeds() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut stats = collector(&store, &feed, rx);

        feed.fail_next_stats(2);
        assert!(!stats.tick().await);
        assert!(store.snapshots().is_empty());

        assert!(stats.tick().await);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut stats = collector(&store, &feed, rx);

        store.fail_next_snapshots(2);
        assert!(!stats.tick().await);
        assert!(stats.tick().await);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[test]
    fn captured_at_strictly_increases() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut stats = collector(&store, &feed, rx);

        let now = Utc::now();
        let first = stats.next_captured_at("vid", now);
        let second = stats.next_captured_at("vid", now);
        let earlier = stats.next_captured_at("vid", now - TimeDelta::seconds(5));
        let other = stats.next_captured_at("other", now);

        assert_eq!(first, now);
        assert!(second > first);
        assert!(earlier > second);
        assert_eq!(other, now);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_signal_snapshots_new_target_immediately() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new());
        let (tx, rx) = mpsc::channel(1);
        let mut stats = collector(&store, &feed, rx);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let setter = store.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            setter.set_setting("youtube_url", "streamB");
            tx.send(RestartReason::TargetChanged).await.unwrap();
            sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        stats.run(&cancel).await.unwrap();

        // Tick at t=0 against A, then the restart at t=10 against B;
        // the regular t=60 tick never came.
        assert_eq!(feed.stats_calls(), vec!["streamA", "streamB"]);
    }
}
