use anyhow::{Result, anyhow, bail};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    feed::{FeedStream, ParseResult},
    health::WorkerKind,
    metrics::{METRICS, RuntimeMetrics},
};

use super::{RestartReason, Worker, WorkerContext};

/// Lifecycle of the chat collector.
///
/// `Idle → Connecting → Streaming → (Stopping | Faulted) → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
    Faulted,
}

/// How a streaming session ended without faulting.
enum SessionEnd {
    Restart(RestartReason),
    Cancelled,
}

/// Streams chat for the current target into the store.
///
/// GUARANTEES:
/// - Every processed message is upserted; duplicates are no-ops
/// - A malformed event or an unstorable message never ends the stream
/// - The heartbeat in `WorkerHealth` advances on connect and on every
///   stored message, and on nothing else
/// - Restart signals are observed between events, so a write that has
///   started always completes
///
/// Faults (stream closed, stream error, connect retries exhausted) are
/// returned to the supervisor.
pub struct ChatCollector {
    ctx: WorkerContext,
    restarts: mpsc::Receiver<RestartReason>,
    backfill_enabled: bool,
    /// Target whose history was already replayed.
    backfilled_target: Option<String>,
    state: ChatState,
}

impl ChatCollector {
    pub fn new(
        ctx: WorkerContext,
        restarts: mpsc::Receiver<RestartReason>,
        backfill_enabled: bool,
    ) -> Self {
        Self {
            ctx,
            restarts,
            backfill_enabled,
            backfilled_target: None,
            state: ChatState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ChatState {
        self.state
    }

    fn set_state(&mut self, next: ChatState) {
        if self.state != next {
            debug!("[chat] {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Drops restart signals that queued up while the worker was not
    /// running (e.g. during the supervisor's restart delay). The resolve at
    /// the start of `collect` already covers whatever they asked for.
    fn discard_stale_restarts(&mut self) -> usize {
        let mut stale = 0;
        while let Ok(reason) = self.restarts.try_recv() {
            debug!("[chat] discarding stale restart ({reason:?})");
            stale += 1;
        }
        stale
    }

    /// Connect, then stream until a restart signal, cancellation or fault.
    /// Restart signals loop back to `Connecting` without leaving `run`.
    async fn collect(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.discard_stale_restarts();

        loop {
            self.set_state(ChatState::Connecting);

            let target = self.ctx.resolver.resolve().await;
            let Some(broadcast_id) = self.ctx.feed.broadcast_id(&target) else {
                bail!("target {target:?} does not name a broadcast");
            };

            // Backfill once per target; a new target gets a fresh pass.
            let replay =
                self.backfill_enabled && self.backfilled_target.as_deref() != Some(target.as_str());

            let feed = self.ctx.feed.clone();
            let retry = self.ctx.retry;
            let connect = retry.run("chat connect", || feed.open(&target, replay));

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                reason = self.restarts.recv() => match reason {
                    Some(reason) => {
                        info!("[chat] restart ({reason:?}) while connecting, abandoning attempt");
                        self.set_state(ChatState::Stopping);
                        continue;
                    }
                    None => return Ok(()),
                },
                result = connect => result,
            };

            let events = opened?;

            if replay {
                self.backfilled_target = Some(target.clone());
            }

            RuntimeMetrics::incr(&METRICS.feed_connects);
            self.ctx.health.touch(WorkerKind::Chat);
            self.set_state(ChatState::Streaming);
            info!(
                "[chat] streaming {broadcast_id} via {} (backfill={replay})",
                feed.name()
            );

            match self.stream(&broadcast_id, events, cancel).await? {
                SessionEnd::Cancelled => return Ok(()),
                SessionEnd::Restart(RestartReason::TargetChanged) => {
                    info!("[chat] target changed, closing stream for {broadcast_id}");
                    self.set_state(ChatState::Stopping);
                }
                SessionEnd::Restart(RestartReason::Stalled) => {
                    warn!("[chat] stream for {broadcast_id} stalled, abandoning connection");
                    self.set_state(ChatState::Stopping);
                }
            }
        }
    }

    async fn stream(
        &mut self,
        broadcast_id: &str,
        mut events: FeedStream,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                reason = self.restarts.recv() => {
                    return Ok(match reason {
                        Some(reason) => SessionEnd::Restart(reason),
                        None => SessionEnd::Cancelled,
                    });
                }
                event = events.next() => match event {
                    Some(Ok(raw)) => self.handle_event(broadcast_id, &raw).await,
                    Some(Err(e)) => return Err(anyhow!(e).context("chat stream failed")),
                    None => bail!("chat stream for {broadcast_id} closed by upstream"),
                },
            }
        }
    }

    async fn handle_event(&self, broadcast_id: &str, raw: &Value) {
        let message = match self.ctx.feed.parse_event(raw, broadcast_id) {
            ParseResult::Chat(message) => message,
            ParseResult::Control => return,
            ParseResult::Error(reason) => {
                RuntimeMetrics::incr(&METRICS.parse_errors);
                warn!("[chat] skipping malformed event: {reason}");
                return;
            }
        };

        RuntimeMetrics::incr(&METRICS.messages_received);

        let store = &self.ctx.store;
        let stored = self
            .ctx
            .retry
            .run("store chat message", || store.upsert_message(&message))
            .await;

        match stored {
            Ok(inserted) => {
                if inserted {
                    RuntimeMetrics::incr(&METRICS.messages_stored);
                } else {
                    RuntimeMetrics::incr(&METRICS.messages_duplicate);
                }
                self.ctx.health.touch(WorkerKind::Chat);
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.messages_dropped);
                warn!("[chat] dropping message {}: {e}", message.message_id);
            }
        }
    }
}

#[async_trait::async_trait]
impl Worker for ChatCollector {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Chat
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let result = self.collect(cancel).await;
        self.set_state(if result.is_ok() {
            ChatState::Idle
        } else {
            ChatState::Faulted
        });
        result
    }
}
