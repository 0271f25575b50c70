use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Global runtime counters for the collector.
///
/// Purpose:
/// - Track chat throughput (received / stored / duplicate / dropped)
/// - Track stats snapshots
/// - Track recovery activity (retries, restarts, target changes)
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe in async + multithreaded contexts
///
/// Per-worker liveness lives in `health::WorkerHealth`, not here.
#[derive(Default)]
pub struct RuntimeMetrics {
    // Chat
    pub messages_received: AtomicUsize,
    pub messages_stored: AtomicUsize,
    pub messages_duplicate: AtomicUsize,
    pub messages_dropped: AtomicUsize,
    pub parse_errors: AtomicUsize,

    // Stats
    pub stats_snapshots: AtomicUsize,
    pub stats_failures: AtomicUsize,

    // Recovery
    pub retry_attempts: AtomicUsize,
    pub feed_connects: AtomicUsize,
    pub worker_restarts: AtomicUsize,
    pub watchdog_restarts: AtomicUsize,
    pub target_changes: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line summary used by the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "recv={} stored={} dup={} dropped={} parse_err={} stats={} stats_err={} retries={} connects={} restarts={} watchdog={} target_changes={}",
            get(&self.messages_received),
            get(&self.messages_stored),
            get(&self.messages_duplicate),
            get(&self.messages_dropped),
            get(&self.parse_errors),
            get(&self.stats_snapshots),
            get(&self.stats_failures),
            get(&self.retry_attempts),
            get(&self.feed_connects),
            get(&self.worker_restarts),
            get(&self.watchdog_restarts),
            get(&self.target_changes),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Logs the counters every `every` until `cancel` fires.
pub async fn run_reporter(every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; skip it so the first line has data.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => info!("[METRICS] {}", METRICS.summary()),
        }
    }
}
