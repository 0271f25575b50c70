//! In-memory doubles for the store and the feed, used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::feed::{ChatFeed, FeedError, FeedStream, ParseResult, youtube};
use crate::schema::{ChatMessage, StatsSample, StatsSnapshot};
use crate::store::{ChatStore, StoreError};

/// Consumes one unit from a failure budget; true if the call should fail.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ------------------------------------------------------------
// Store
// ------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<HashMap<String, String>>,
    messages: Mutex<HashMap<(String, String), ChatMessage>>,
    snapshots: Mutex<Vec<StatsSnapshot>>,
    fail_settings: AtomicBool,
    failing_upserts: AtomicU32,
    failing_snapshots: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.settings.lock().insert(key.to_string(), value.to_string());
    }

    pub fn fail_settings(&self, fail: bool) {
        self.fail_settings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_upserts(&self, n: u32) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_snapshots(&self, n: u32) {
        self.failing_snapshots.store(n, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn has_message(&self, broadcast_id: &str, message_id: &str) -> bool {
        self.messages
            .lock()
            .contains_key(&(broadcast_id.to_string(), message_id.to_string()))
    }

    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_settings.load(Ordering::SeqCst) {
            return Err(StoreError::PoolExhausted);
        }
        Ok(self.settings.lock().get(key).cloned())
    }

    async fn upsert_message(&self, message: &ChatMessage) -> Result<bool, StoreError> {
        if take_failure(&self.failing_upserts) {
            return Err(StoreError::PoolExhausted);
        }
        let key = (message.broadcast_id.clone(), message.message_id.clone());
        let mut messages = self.messages.lock();
        if messages.contains_key(&key) {
            return Ok(false);
        }
        messages.insert(key, message.clone());
        Ok(true)
    }

    async fn insert_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError> {
        if take_failure(&self.failing_snapshots) {
            return Err(StoreError::PoolExhausted);
        }
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

// ------------------------------------------------------------
// Feed
// ------------------------------------------------------------

/// Feed whose chat streams replay a fixed script per target and then go
/// silent (never end), like a stalled upstream.
#[derive(Default)]
pub struct ScriptedFeed {
    scripts: Mutex<HashMap<String, Vec<Value>>>,
    opens: Mutex<Vec<(String, bool)>>,
    open_attempts: AtomicU32,
    failing_opens: AtomicU32,
    stats_calls: Mutex<Vec<String>>,
    failing_stats: AtomicU32,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, target: &str, events: Vec<Value>) {
        self.scripts.lock().insert(target.to_string(), events);
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_stats(&self, n: u32) {
        self.failing_stats.store(n, Ordering::SeqCst);
    }

    /// Successful opens as (target, replay).
    pub fn opens(&self) -> Vec<(String, bool)> {
        self.opens.lock().clone()
    }

    pub fn open_attempts(&self) -> u32 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> Vec<String> {
        self.stats_calls.lock().clone()
    }
}

#[async_trait]
impl ChatFeed for ScriptedFeed {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn broadcast_id(&self, target: &str) -> Option<String> {
        let target = target.trim();
        (!target.is_empty()).then(|| target.to_string())
    }

    async fn open(&self, target: &str, replay: bool) -> Result<FeedStream, FeedError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_opens) {
            return Err(FeedError::Api {
                status: 503,
                reason: "backendError".into(),
                message: "scripted failure".into(),
            });
        }

        self.opens.lock().push((target.to_string(), replay));
        let events = self.scripts.lock().get(target).cloned().unwrap_or_default();

        Ok(stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }

    fn parse_event(&self, raw: &Value, broadcast_id: &str) -> ParseResult {
        youtube::parse_chat_item(raw, broadcast_id)
    }

    async fn fetch_stats(&self, target: &str) -> Result<StatsSample, FeedError> {
        self.stats_calls.lock().push(target.to_string());
        if take_failure(&self.failing_stats) {
            return Err(FeedError::Api {
                status: 500,
                reason: "backendError".into(),
                message: "scripted failure".into(),
            });
        }
        Ok(StatsSample {
            concurrent_viewers: Some(100),
            view_count: Some(1_000),
            like_count: Some(10),
            is_live: true,
        })
    }
}

/// A minimal upstream text message.
pub fn text_event(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "snippet": {
            "type": "textMessageEvent",
            "publishedAt": "2024-05-01T12:00:00Z",
            "textMessageDetails": { "messageText": text }
        },
        "authorDetails": { "displayName": "viewer", "channelId": "UCviewer" }
    })
}
