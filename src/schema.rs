use chrono::{DateTime, Utc};

/// Kind of chat event a `ChatMessage` was normalized from.
///
/// Stored as a lowercase string (`text`, `super_chat`, ...) so downstream
/// consumers (dashboard, ETL, text mining) can filter without joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    SuperChat,
    SuperSticker,
    Membership,
    MemberMilestone,
    MembershipGift,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::SuperChat => "super_chat",
            MessageKind::SuperSticker => "super_sticker",
            MessageKind::Membership => "membership",
            MessageKind::MemberMilestone => "member_milestone",
            MessageKind::MembershipGift => "membership_gift",
        }
    }

    /// Paid events carry an amount.
    pub fn is_paid(self) -> bool {
        matches!(self, MessageKind::SuperChat | MessageKind::SuperSticker)
    }
}

// ------------------------------------------------------------
// Chat message
// ------------------------------------------------------------
//
// One row per feed event.
//
// INVARIANTS:
// - (broadcast_id, message_id) is unique; re-delivery is a no-op
// - Never mutated after insertion
//
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Upstream message id, unique per broadcast
    pub message_id: String,

    /// Video id of the broadcast
    pub broadcast_id: String,

    pub author_name: String,
    pub author_channel_id: Option<String>,

    /// Display text; empty for stickers without a comment
    pub body: String,

    pub kind: MessageKind,

    /// Time the upstream says the message was published
    pub published_at: DateTime<Utc>,

    /// Paid amount in micros of `currency` (super chats and stickers)
    pub amount_micros: Option<i64>,
    pub currency: Option<String>,

    /// Human readable amount as shown by the platform (e.g. "¥500")
    pub amount_display: Option<String>,

    /// Time this process received the message
    pub collected_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_paid(&self) -> bool {
        self.kind.is_paid()
    }
}

// ------------------------------------------------------------
// Statistics
// ------------------------------------------------------------
//
// `StatsSample` is what the feed returns; `StatsSnapshot` is the row the
// stats collector appends after stamping it.
//
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub concurrent_viewers: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,

    /// The broadcast currently has an active live chat
    pub is_live: bool,
}

/// INVARIANT: `captured_at` strictly increases per broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub broadcast_id: String,
    pub captured_at: DateTime<Utc>,
    pub concurrent_viewers: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub is_live: bool,
}

impl StatsSnapshot {
    pub fn from_sample(
        broadcast_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        sample: StatsSample,
    ) -> Self {
        Self {
            broadcast_id: broadcast_id.into(),
            captured_at,
            concurrent_viewers: sample.concurrent_viewers,
            view_count: sample.view_count,
            like_count: sample.like_count,
            is_live: sample.is_live,
        }
    }
}
