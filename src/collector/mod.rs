/// Collector module
///
/// This module groups the long-running workers and their supervisor:
/// - `chat`:        streams chat messages into the store
/// - `stats`:       periodic statistics snapshots
/// - `url_monitor`: detects target changes, requests re-targeting
/// - `watchdog`:    detects stalled chat streams, requests restarts
/// - `supervisor`:  lifecycle and restart routing
///
/// Design notes:
/// - Upstream-specific logic MUST NOT live here (see `feed`)
/// - Workers never call each other; they only send `RestartRequest`s
///   to the supervisor, which forwards them to the targeted worker
/// - The store and `WorkerHealth` are the only shared state
pub mod chat;
pub mod stats;
pub mod supervisor;
pub mod url_monitor;
pub mod watchdog;

use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::{
    feed::ChatFeed,
    health::{WorkerHealth, WorkerKind},
    retry::RetryPolicy,
    store::ChatStore,
    target::TargetResolver,
};

/// Why a worker is being asked to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// URL monitor observed a new target; stop gracefully and re-resolve.
    TargetChanged,

    /// Watchdog saw a stale heartbeat; abandon the connection.
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest {
    pub worker: WorkerKind,
    pub reason: RestartReason,
}

/// Sending side of the supervisor's control channel.
///
/// Never blocks: monitors must keep their own timing even if the
/// supervisor is slow to drain requests.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<RestartRequest>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<RestartRequest>) -> Self {
        Self { tx }
    }

    /// Returns `false` if the request could not be queued.
    pub fn request_restart(&self, worker: WorkerKind, reason: RestartReason) -> bool {
        match self.tx.try_send(RestartRequest { worker, reason }) {
            Ok(()) => true,
            Err(TrySendError::Full(req)) => {
                warn!("control queue full, dropping restart request {req:?}");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Dependencies shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn ChatStore>,
    pub feed: Arc<dyn ChatFeed>,
    pub resolver: TargetResolver,
    pub health: Arc<WorkerHealth>,
    pub retry: RetryPolicy,
}

/// A supervised unit of work.
///
/// CONTRACT:
/// - `run` returns `Ok(())` once `cancel` fires
/// - Returning early (Ok or Err) is a fault; the supervisor restarts the
///   worker after its restart delay, reusing the same instance so restart
///   channels and per-worker memory survive
#[async_trait::async_trait]
pub trait Worker: Send {
    fn kind(&self) -> WorkerKind;

    async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;
}
