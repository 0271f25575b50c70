/// Utility helpers shared by the collectors and the feed adapter.
///
/// This module contains:
/// - Target normalization (URL → broadcast id)
/// - Small parsing helpers for upstream payload fields
///
/// IMPORTANT:
/// - No worker logic should live here.
/// - Everything in this module must remain pure and deterministic.

use chrono::{DateTime, Utc};

/// Length of a YouTube video id.
const VIDEO_ID_LEN: usize = 11;

/// URL path prefixes that are directly followed by the video id.
const PATH_PREFIXES: [&str; 4] = ["/live/", "/shorts/", "/embed/", "/v/"];

/// Normalize a configured target into the broadcast id used as the
/// storage key and as the upstream lookup key.
///
/// Accepted forms:
/// - "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
/// - "https://youtu.be/dQw4w9WgXcQ?si=..."
/// - "https://www.youtube.com/live/dQw4w9WgXcQ"
/// - "dQw4w9WgXcQ" (bare id)
///
/// Returns `None` if no plausible id can be found.
pub fn broadcast_id_from_target(target: &str) -> Option<String> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    if is_video_id(target) {
        return Some(target.to_string());
    }

    // Query parameter form: watch?v=<id>
    if let Some((_, query)) = target.split_once('?') {
        for pair in query.split('&') {
            if let Some(id) = pair.strip_prefix("v=") {
                let id = truncate_id(id);
                if is_video_id(id) {
                    return Some(id.to_string());
                }
            }
        }
    }

    let without_query = target.split(['?', '#']).next().unwrap_or(target);

    // Short link form: youtu.be/<id>
    if let Some(idx) = without_query.find("youtu.be/") {
        let id = truncate_id(&without_query[idx + "youtu.be/".len()..]);
        if is_video_id(id) {
            return Some(id.to_string());
        }
    }

    for prefix in PATH_PREFIXES {
        if let Some(idx) = without_query.find(prefix) {
            let id = truncate_id(&without_query[idx + prefix.len()..]);
            if is_video_id(id) {
                return Some(id.to_string());
            }
        }
    }

    None
}

/// Two targets are the same broadcast if they trim to the same string.
///
/// URL formatting differences (e.g. `youtu.be` vs `watch?v=`) are
/// deliberately treated as a change: the operator edited the setting.
pub fn same_target(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Parse an RFC 3339 timestamp as sent by the upstream API.
///
/// Falls back to "now" for missing or malformed values; a message with a
/// bad timestamp is still worth keeping.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Parse an integer that the upstream API encodes as a JSON string
/// (e.g. `"concurrentViewers": "1234"`), accepting plain numbers too.
pub fn parse_count(value: Option<&serde_json::Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn truncate_id(s: &str) -> &str {
    let end = s
        .char_indices()
        .find(|(_, c)| !is_id_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    &s[..end]
}

fn is_video_id(s: &str) -> bool {
    s.len() == VIDEO_ID_LEN && s.chars().all(is_id_char)
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
