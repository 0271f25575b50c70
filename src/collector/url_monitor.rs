use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    health::{WorkerHealth, WorkerKind},
    metrics::{METRICS, RuntimeMetrics},
    target::TargetResolver,
    util,
};

use super::{ControlHandle, RestartReason, Worker};

/// Polls the target setting and re-targets collection when it changes.
///
/// The restart requests carry no payload: the chat and stats collectors
/// each re-resolve the target themselves and converge on the same value.
pub struct UrlMonitor {
    resolver: TargetResolver,
    control: ControlHandle,
    health: Arc<WorkerHealth>,
    every: Duration,
    last_seen: String,
}

impl UrlMonitor {
    /// `initial` is the target the supervisor resolved at startup.
    pub fn new(
        resolver: TargetResolver,
        control: ControlHandle,
        health: Arc<WorkerHealth>,
        every: Duration,
        initial: String,
    ) -> Self {
        Self {
            resolver,
            control,
            health,
            every,
            last_seen: initial,
        }
    }

    #[cfg(test)]
    pub fn last_seen(&self) -> &str {
        &self.last_seen
    }

    /// Records `target`; true if it differs from the last seen one.
    pub fn observe(&mut self, target: String) -> bool {
        if util::same_target(&self.last_seen, &target) {
            return false;
        }
        info!("[url-monitor] target changed: {} → {}", self.last_seen, target);
        self.last_seen = target;
        true
    }

    pub async fn check(&mut self) -> bool {
        let target = self.resolver.resolve().await;
        self.health.touch(WorkerKind::UrlMonitor);

        if !self.observe(target) {
            debug!("[url-monitor] target unchanged");
            return false;
        }

        RuntimeMetrics::incr(&METRICS.target_changes);
        self.control
            .request_restart(WorkerKind::Chat, RestartReason::TargetChanged);
        self.control
            .request_restart(WorkerKind::Stats, RestartReason::TargetChanged);
        true
    }
}

#[async_trait::async_trait]
impl Worker for UrlMonitor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::UrlMonitor
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The initial target is already known; first real check is one
        // interval out.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
    }
}
