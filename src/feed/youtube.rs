use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use log::{debug, info};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::{
    retry::RetryPolicy,
    schema::{ChatMessage, MessageKind, StatsSample},
    util,
};

use super::{ChatFeed, FeedError, FeedStream, ParseResult};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Upper bound accepted by `liveChatMessages.list`.
const PAGE_SIZE: &str = "2000";

/// Clamp for the server supplied `pollingIntervalMillis`.
const MIN_POLL: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasons the API uses when the key itself is refused.
const REJECTED_REASONS: [&str; 6] = [
    "keyInvalid",
    "keyExpired",
    "quotaExceeded",
    "dailyLimitExceeded",
    "accessNotConfigured",
    "ipRefererBlocked",
];

/// YouTube Data API v3 adapter
///
/// Endpoints:
/// - `videos.list` (statistics, live chat id discovery)
/// - `liveChatMessages.list` (chat, long-polled)
///
/// All upstream quirks live here:
/// - amounts come as strings of micros
/// - counts come as strings
/// - the server dictates the polling interval
///
/// Polls inside an open stream go through `retry`; only an exhausted poll
/// surfaces as a stream error.
pub struct YouTubeFeed {
    api: ApiClient,
    retry: RetryPolicy,
}

#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    api_key: Arc<str>,
    base_url: Arc<str>,
}

/// Envelope of one `liveChatMessages.list` page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatPage {
    next_page_token: Option<String>,
    polling_interval_millis: Option<u64>,
    /// Present once the broadcast went offline.
    offline_at: Option<String>,
    #[serde(default)]
    items: Vec<Value>,
}

/// Long-poll state behind a `FeedStream`.
struct ChatPoll {
    api: ApiClient,
    retry: RetryPolicy,
    live_chat_id: String,
    page_token: Option<String>,
    pending: VecDeque<Value>,
    wait: Duration,
    offline: bool,
    finished: bool,
}

impl YouTubeFeed {
    pub fn new(api_key: &str, retry: RetryPolicy) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            api: ApiClient {
                http,
                api_key: Arc::from(api_key),
                base_url: Arc::from(API_BASE),
            },
            retry,
        })
    }

    fn video_id(&self, target: &str) -> Result<String, FeedError> {
        util::broadcast_id_from_target(target)
            .ok_or_else(|| FeedError::InvalidTarget(target.to_string()))
    }
}

#[async_trait::async_trait]
impl ChatFeed for YouTubeFeed {
    fn name(&self) -> &'static str {
        "youtube"
    }

    fn broadcast_id(&self, target: &str) -> Option<String> {
        util::broadcast_id_from_target(target)
    }

    async fn open(&self, target: &str, replay: bool) -> Result<FeedStream, FeedError> {
        let video_id = self.video_id(target)?;

        let video = self.api.video(&video_id, "liveStreamingDetails").await?;
        let live_chat_id = video["liveStreamingDetails"]["activeLiveChatId"]
            .as_str()
            .ok_or_else(|| FeedError::NotLive(video_id.clone()))?
            .to_string();

        // The first page is the history the API is willing to replay.
        let first = self.api.chat_page(&live_chat_id, None).await?;

        let mut poll = ChatPoll::new(self.api.clone(), self.retry, live_chat_id);
        let replayed = poll.absorb(first, replay);

        info!(
            "[youtube] chat open for {video_id} (replayed {replayed} events, next poll in {:?})",
            poll.wait
        );

        Ok(poll.into_stream())
    }

    fn parse_event(&self, raw: &Value, broadcast_id: &str) -> ParseResult {
        parse_chat_item(raw, broadcast_id)
    }

    async fn fetch_stats(&self, target: &str) -> Result<StatsSample, FeedError> {
        let video_id = self.video_id(target)?;
        let video = self
            .api
            .video(&video_id, "liveStreamingDetails,statistics")
            .await?;
        Ok(stats_from_video(&video))
    }
}

impl ApiClient {
    async fn get(&self, resource: &str, params: &[(&str, &str)]) -> Result<Value, FeedError> {
        let mut query: Vec<(&str, &str)> = params.to_vec();
        query.push(("key", &*self.api_key));

        let url = Url::parse_with_params(&format!("{}/{}", self.base_url, resource), &query)
            .map_err(|e| FeedError::Request(e.to_string()))?;

        let resp = self.http.get(url).send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json::<Value>().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }

    async fn video(&self, video_id: &str, parts: &str) -> Result<Value, FeedError> {
        let mut body = self
            .get("videos", &[("part", parts), ("id", video_id)])
            .await?;

        match body.get_mut("items").and_then(Value::as_array_mut) {
            Some(items) if !items.is_empty() => Ok(items.swap_remove(0)),
            _ => Err(FeedError::VideoNotFound(video_id.to_string())),
        }
    }

    async fn chat_page(
        &self,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChatPage, FeedError> {
        let mut params = vec![
            ("liveChatId", live_chat_id),
            ("part", "snippet,authorDetails"),
            ("maxResults", PAGE_SIZE),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let body = self.get("liveChat/messages", &params).await?;
        serde_json::from_value(body).map_err(|e| FeedError::Decode(e.to_string()))
    }
}

impl ChatPoll {
    fn new(api: ApiClient, retry: RetryPolicy, live_chat_id: String) -> Self {
        Self {
            api,
            retry,
            live_chat_id,
            page_token: None,
            pending: VecDeque::new(),
            wait: MIN_POLL,
            offline: false,
            finished: false,
        }
    }

    /// Takes over cursor and pacing from a page; queues its items only when
    /// `keep_items`. Returns the number of queued items.
    fn absorb(&mut self, page: ChatPage, keep_items: bool) -> usize {
        if page.next_page_token.is_some() {
            self.page_token = page.next_page_token;
        }
        if let Some(ms) = page.polling_interval_millis {
            self.wait = Duration::from_millis(ms).clamp(MIN_POLL, MAX_POLL);
        }
        self.offline = page.offline_at.is_some();

        if !keep_items {
            return 0;
        }
        let n = page.items.len();
        self.pending.extend(page.items);
        n
    }

    /// Drains queued items, then sleeps for the server interval and polls
    /// again. Ends after the broadcast goes offline. A failed poll is
    /// retried with the same page token; once retries are exhausted the
    /// last error is yielded and the stream ends.
    fn into_stream(self) -> FeedStream {
        stream::unfold(self, |mut poll| async move {
            loop {
                if let Some(item) = poll.pending.pop_front() {
                    return Some((Ok(item), poll));
                }
                if poll.finished || poll.offline {
                    debug!("[youtube] chat {} finished", poll.live_chat_id);
                    return None;
                }

                sleep(poll.wait).await;

                let page = {
                    let api = &poll.api;
                    let live_chat_id = poll.live_chat_id.as_str();
                    let page_token = poll.page_token.as_deref();
                    poll.retry
                        .run("chat poll", || api.chat_page(live_chat_id, page_token))
                        .await
                };

                match page {
                    Ok(page) => {
                        poll.absorb(page, true);
                    }
                    Err(exhausted) => {
                        poll.finished = true;
                        return Some((Err(exhausted.last_error), poll));
                    }
                }
            }
        })
        .boxed()
    }
}

/// Maps an error response body onto a `FeedError`.
fn api_error(status: u16, body: &str) -> FeedError {
    let v: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    let message = v["error"]["message"].as_str().unwrap_or(body).to_string();
    let reason = v["error"]["errors"][0]["reason"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    match reason.as_str() {
        "liveChatEnded" => FeedError::Ended,
        "liveChatNotFound" | "liveChatDisabled" => FeedError::NotLive(message),
        r if status == 401 || REJECTED_REASONS.contains(&r) => FeedError::Rejected(message),
        _ => FeedError::Api {
            status,
            reason,
            message,
        },
    }
}

/// Normalizes one `liveChatMessage` resource.
pub fn parse_chat_item(raw: &Value, broadcast_id: &str) -> ParseResult {
    let Some(id) = raw.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return ParseResult::Error("message without id".into());
    };

    let snippet = match raw.get("snippet") {
        Some(s) if s.is_object() => s,
        _ => return ParseResult::Error(format!("message {id} has no snippet")),
    };

    let Some(event_type) = snippet.get("type").and_then(Value::as_str) else {
        return ParseResult::Error(format!("message {id} has no type"));
    };

    let display = snippet["displayMessage"].as_str();

    let (kind, body, paid) = match event_type {
        "textMessageEvent" => {
            let text = snippet["textMessageDetails"]["messageText"].as_str().or(display);
            match text {
                Some(t) => (MessageKind::Text, t.to_string(), None),
                None => return ParseResult::Error(format!("text message {id} has no text")),
            }
        }

        "superChatEvent" => {
            let details = &snippet["superChatDetails"];
            let body = details["userComment"].as_str().unwrap_or_default();
            (MessageKind::SuperChat, body.to_string(), Some(details))
        }

        "superStickerEvent" => {
            let details = &snippet["superStickerDetails"];
            let body = details["superStickerMetadata"]["altText"]
                .as_str()
                .unwrap_or_default();
            (MessageKind::SuperSticker, body.to_string(), Some(details))
        }

        "newSponsorEvent" => (
            MessageKind::Membership,
            display.unwrap_or_default().to_string(),
            None,
        ),

        "memberMilestoneChatEvent" => {
            let body = snippet["memberMilestoneChatDetails"]["userComment"]
                .as_str()
                .or(display)
                .unwrap_or_default();
            (MessageKind::MemberMilestone, body.to_string(), None)
        }

        "membershipGiftingEvent" => (
            MessageKind::MembershipGift,
            display.unwrap_or_default().to_string(),
            None,
        ),

        // Deletions, bans, polls, mode changes, chat end, tombstones
        _ => return ParseResult::Control,
    };

    let (amount_micros, currency, amount_display) = match paid {
        Some(details) => {
            let Some(micros) = util::parse_count(details.get("amountMicros")) else {
                return ParseResult::Error(format!("paid message {id} has no amount"));
            };
            (
                Some(micros),
                details["currency"].as_str().map(String::from),
                details["amountDisplayString"].as_str().map(String::from),
            )
        }
        None => (None, None, None),
    };

    let author = &raw["authorDetails"];

    ParseResult::Chat(ChatMessage {
        message_id: id.to_string(),
        broadcast_id: broadcast_id.to_string(),
        author_name: author["displayName"].as_str().unwrap_or_default().to_string(),
        author_channel_id: author["channelId"]
            .as_str()
            .or(snippet["authorChannelId"].as_str())
            .map(String::from),
        body,
        kind,
        published_at: util::parse_timestamp(snippet["publishedAt"].as_str()),
        amount_micros,
        currency,
        amount_display,
        collected_at: chrono::Utc::now(),
    })
}

/// Extracts the statistics snapshot from a `videos.list` item.
pub fn stats_from_video(video: &Value) -> StatsSample {
    let live = &video["liveStreamingDetails"];
    let stats = &video["statistics"];

    StatsSample {
        concurrent_viewers: util::parse_count(live.get("concurrentViewers")),
        view_count: util::parse_count(stats.get("viewCount")),
        like_count: util::parse_count(stats.get("likeCount")),
        is_live: live.get("activeLiveChatId").is_some() && live.get("actualEndTime").is_none(),
    }
}
