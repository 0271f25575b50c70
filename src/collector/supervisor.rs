use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ScheduleConfig,
    health::{WorkerHealth, WorkerKind},
    metrics::{METRICS, RuntimeMetrics},
};

use super::{
    ControlHandle, RestartReason, RestartRequest, Worker, WorkerContext, chat::ChatCollector,
    stats::StatsCollector, url_monitor::UrlMonitor, watchdog::Watchdog,
};

/// Capacity of the control channel shared by the URL monitor and the
/// watchdog. Both send at most a couple of requests per tick.
const CONTROL_QUEUE: usize = 16;

/// Owns the four workers and routes restart requests between them.
///
/// DESIGN:
/// - Every worker runs in its own task under `supervise`, which restarts
///   it alone when it faults
/// - Restartable workers (chat, stats) each own a one-slot restart
///   channel; a request arriving while one is pending is coalesced
/// - The URL monitor and the watchdog only see a `ControlHandle`
///
/// Lifecycle: `start()` once, then `stop()`.
pub struct Supervisor {
    ctx: WorkerContext,
    schedule: ScheduleConfig,
    backfill_enabled: bool,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(ctx: WorkerContext, schedule: ScheduleConfig, backfill_enabled: bool) -> Self {
        Self {
            ctx,
            schedule,
            backfill_enabled,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Resolves the initial target and spawns every worker.
    pub async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() || self.cancel.is_cancelled() {
            bail!("supervisor already started");
        }

        let initial = self.ctx.resolver.resolve().await;
        info!("[supervisor] starting workers, initial target {initial}");

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (chat_tx, chat_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let control = ControlHandle::new(control_tx);

        self.tasks.push(tokio::spawn(route_restarts(
            control_rx,
            chat_tx,
            stats_tx,
            self.cancel.clone(),
        )));

        self.spawn(ChatCollector::new(
            self.ctx.clone(),
            chat_rx,
            self.backfill_enabled,
        ));
        self.spawn(StatsCollector::new(
            self.ctx.clone(),
            stats_rx,
            self.schedule.stats_poll_interval(),
        ));
        self.spawn(UrlMonitor::new(
            self.ctx.resolver.clone(),
            control.clone(),
            self.ctx.health.clone(),
            self.schedule.url_check_interval(),
            initial,
        ));
        self.spawn(Watchdog::new(
            self.ctx.health.clone(),
            control,
            self.schedule.watchdog_timeout(),
            self.schedule.watchdog_check_interval(),
        ));

        Ok(())
    }

    /// Cancels every worker and waits for their tasks to finish.
    pub async fn stop(&mut self) {
        info!("[supervisor] stopping {} tasks", self.tasks.len());
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("[supervisor] task ended abnormally: {e}");
            }
        }

        for kind in WorkerKind::ALL {
            if let Some(status) = self.ctx.health.status(kind) {
                info!(
                    "[supervisor] {kind}: running={} failures={} idle={:?}",
                    status.running,
                    status.consecutive_failures,
                    status.last_activity.elapsed()
                );
            }
        }
        info!("[supervisor] all workers stopped");
    }

    fn spawn<W>(&mut self, worker: W)
    where
        W: Worker + 'static,
    {
        self.tasks.push(tokio::spawn(supervise(
            worker,
            self.ctx.health.clone(),
            self.cancel.clone(),
            self.schedule.worker_restart_delay(),
        )));
    }
}

// ------------------------------------------------------------
// Worker lifecycle
// ------------------------------------------------------------
//
// Runs one worker until cancellation. Any return before cancellation
// is a fault: it is logged, counted, and the same worker instance is
// run again after `restart_delay`. Faults never leave this task.
//
async fn supervise<W: Worker>(
    mut worker: W,
    health: Arc<WorkerHealth>,
    cancel: CancellationToken,
    restart_delay: Duration,
) {
    let kind = worker.kind();

    loop {
        health.mark_started(kind);
        info!("[supervisor] {kind} started");

        let result = worker.run(&cancel).await;
        health.mark_stopped(kind);

        if cancel.is_cancelled() {
            info!("[supervisor] {kind} stopped");
            break;
        }

        let failures = health.record_failure(kind);
        RuntimeMetrics::incr(&METRICS.worker_restarts);

        match result {
            Ok(()) => warn!(
                "[supervisor] {kind} exited unexpectedly (failure #{failures}), restarting in {restart_delay:?}"
            ),
            Err(e) => error!(
                "[supervisor] {kind} faulted (failure #{failures}): {e:#}; restarting in {restart_delay:?}"
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[supervisor] {kind} stopped");
                break;
            }
            _ = sleep(restart_delay) => {}
        }
    }
}

// ------------------------------------------------------------
// Restart routing
// ------------------------------------------------------------

async fn route_restarts(
    mut control: mpsc::Receiver<RestartRequest>,
    chat: mpsc::Sender<RestartReason>,
    stats: mpsc::Sender<RestartReason>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = control.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let target = match request.worker {
            WorkerKind::Chat => &chat,
            WorkerKind::Stats => &stats,
            other => {
                warn!("[supervisor] {other} cannot be restarted on request, ignoring");
                continue;
            }
        };

        match target.try_send(request.reason) {
            Ok(()) => info!(
                "[supervisor] restart requested for {} ({:?})",
                request.worker, request.reason
            ),
            Err(TrySendError::Full(_)) => debug!(
                "[supervisor] {} already has a restart pending, coalescing {:?}",
                request.worker, request.reason
            ),
            Err(TrySendError::Closed(_)) => {
                warn!("[supervisor] {} is not listening for restarts", request.worker)
            }
        }
    }
}
