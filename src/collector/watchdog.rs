use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    health::{WorkerHealth, WorkerKind},
    metrics::{METRICS, RuntimeMetrics},
};

use super::{ControlHandle, RestartReason, Worker};

/// Restarts the chat collector when its heartbeat goes stale.
///
/// A silent stream is indistinguishable from a quiet chat, so this trades
/// one needless reconnect per idle window for never hanging on a dead
/// connection.
///
/// GUARANTEES:
/// - At most one restart request per stale window
/// - A fresh heartbeat re-arms the watchdog immediately
pub struct Watchdog {
    health: Arc<WorkerHealth>,
    control: ControlHandle,
    timeout: Duration,
    every: Duration,
    last_fired: Option<Instant>,
}

impl Watchdog {
    pub fn new(
        health: Arc<WorkerHealth>,
        control: ControlHandle,
        timeout: Duration,
        every: Duration,
    ) -> Self {
        Self {
            health,
            control,
            timeout,
            every,
            last_fired: None,
        }
    }

    /// Pure staleness decision; updates the firing memory.
    pub fn should_restart(&mut self, last_heartbeat: Instant, now: Instant) -> bool {
        if matches!(self.last_fired, Some(fired) if last_heartbeat > fired) {
            self.last_fired = None;
        }

        if now.saturating_duration_since(last_heartbeat) <= self.timeout {
            return false;
        }

        match self.last_fired {
            Some(fired) if now.saturating_duration_since(fired) <= self.timeout => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    pub fn check(&mut self) -> bool {
        self.health.touch(WorkerKind::Watchdog);

        // Chat not registered yet: nothing to judge.
        let Some(heartbeat) = self.health.last_activity(WorkerKind::Chat) else {
            return false;
        };

        let now = Instant::now();
        if !self.should_restart(heartbeat, now) {
            debug!(
                "[watchdog] chat idle for {:?}",
                now.saturating_duration_since(heartbeat)
            );
            return false;
        }

        warn!(
            "[watchdog] no chat activity for {:?} (timeout {:?}), requesting restart",
            now.saturating_duration_since(heartbeat),
            self.timeout
        );
        RuntimeMetrics::incr(&METRICS.watchdog_restarts);
        self.control
            .request_restart(WorkerKind::Chat, RestartReason::Stalled);
        true
    }
}

#[async_trait::async_trait]
impl Worker for Watchdog {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Watchdog
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }
    }
}
