//! Upstream feed abstraction
//!
//! This module provides:
//! - The `ChatFeed` trait every upstream integration implements
//! - The shared error type and parse result
//! - A factory resolving the configured feed implementation
//!
//! Workers interact with the upstream exclusively through `ChatFeed`.

pub mod youtube;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::config::FeedConfig;
use crate::retry::RetryPolicy;
use crate::schema::{ChatMessage, StatsSample};

/// Raw events as delivered by the upstream, one JSON payload per item.
///
/// The stream ends when the upstream closes the chat; an `Err` item is
/// terminal for that connection.
pub type FeedStream = BoxStream<'static, Result<Value, FeedError>>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    Request(String),

    /// Credential or quota refusal. Retrying will not help until an
    /// operator intervenes, but the worker keeps trying on restart.
    #[error("feed rejected credentials: {0}")]
    Rejected(String),

    #[error("upstream returned {status} ({reason}): {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("no active live chat: {0}")]
    NotLive(String),

    #[error("live chat ended")]
    Ended,

    #[error("video {0} not found")]
    VideoNotFound(String),

    #[error("cannot derive a broadcast id from target {0:?}")]
    InvalidTarget(String),

    #[error("unexpected payload: {0}")]
    Decode(String),
}

/// Outcome of normalizing one raw feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A chat message worth persisting
    Chat(ChatMessage),

    /// Valid but not a message (deletions, bans, polls, mode changes, ...)
    Control,

    /// Malformed payload; logged, counted and skipped
    Error(String),
}

/// Abstraction between the generic collectors and a concrete live-chat API.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One instance is shared by the chat and stats collectors
#[async_trait::async_trait]
pub trait ChatFeed: Send + Sync {
    /// Canonical name, used for logging.
    fn name(&self) -> &'static str;

    /// Maps a configured target (URL or id) onto the broadcast id used as
    /// the storage key. `None` if the target is not understood.
    fn broadcast_id(&self, target: &str) -> Option<String>;

    /// Opens the chat stream for `target`.
    ///
    /// With `replay`, the stream starts with whatever history the upstream
    /// can replay before tailing live events; otherwise history is skipped.
    async fn open(&self, target: &str, replay: bool) -> Result<FeedStream, FeedError>;

    /// Normalizes one raw event.
    ///
    /// IMPORTANT:
    /// - Must never panic
    /// - Invalid payloads become `ParseResult::Error`
    fn parse_event(&self, raw: &Value, broadcast_id: &str) -> ParseResult;

    /// One point-in-time statistics read for `target`.
    async fn fetch_stats(&self, target: &str) -> Result<StatsSample, FeedError>;
}

/// Builds the feed used in production. `retry` paces re-polls inside an
/// open chat stream.
pub fn build_feed(cfg: &FeedConfig, retry: RetryPolicy) -> Result<Arc<dyn ChatFeed>, FeedError> {
    Ok(Arc::new(youtube::YouTubeFeed::new(&cfg.api_key, retry)?))
}
