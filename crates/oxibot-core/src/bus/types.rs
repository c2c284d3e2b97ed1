//! Bus event types — messages flowing between channels and the agent loop.
//!
//! Replaces nanobot's `bus/events.py` `InboundMessage` / `OutboundMessage` dataclasses.

use crate::types::{GroupMember, MediaAttachment};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Dynamic, channel-agnostic metadata map.
///
/// Recognised keys (all optional): `chat_type` ("p2p"|"group"),
/// `is_mentioned` (bool), `group_policy` ("mention"|"auto"|"open"),
/// `from_bot` (bool), `sender_agent_name` (string), `group_members`
/// (array of [`GroupMember`]), `message_id` (string). Unknown keys are
/// tolerated and passed through untouched.
pub type Metadata = HashMap<String, Value>;

/// An inbound message from a channel to the agent.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "discord", "cli", "system").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier. For `channel == "system"` this is
    /// `"origin_channel:origin_chat_id"`.
    pub chat_id: String,
    /// Text content of the message (already mention-resolved by the channel).
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media (photos, voice, documents).
    pub media: Vec<MediaAttachment>,
    /// Channel-specific / routing metadata.
    pub metadata: Metadata,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Session key combining channel and chat_id (e.g. "telegram:123456").
    ///
    /// Used as the key for session persistence and history lookup.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    // ── typed metadata accessors ──

    pub fn chat_type(&self) -> Option<&str> {
        self.metadata.get("chat_type").and_then(Value::as_str)
    }

    pub fn is_group(&self) -> bool {
        self.chat_type() == Some("group")
    }

    /// Defaults to `false` per the resolved mention-default open question:
    /// `is_mentioned` absent means not mentioned, so `group_policy ==
    /// "mention"` stays reachable.
    pub fn is_mentioned(&self) -> bool {
        self.metadata
            .get("is_mentioned")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn group_policy(&self) -> &str {
        self.metadata
            .get("group_policy")
            .and_then(Value::as_str)
            .unwrap_or("open")
    }

    pub fn from_bot(&self) -> bool {
        self.metadata
            .get("from_bot")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn sender_agent_name(&self) -> Option<&str> {
        self.metadata
            .get("sender_agent_name")
            .and_then(Value::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.metadata.get("message_id").and_then(Value::as_str)
    }

    /// Parses `group_members` out of metadata. Malformed entries are
    /// dropped rather than failing the whole message.
    pub fn group_members(&self) -> Vec<GroupMember> {
        self.metadata
            .get("group_members")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value::<GroupMember>(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An outbound message from the agent to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
    /// Attached media to send.
    pub media: Vec<MediaAttachment>,
    /// Pass-through metadata (channel-specific needs, e.g. thread id).
    pub metadata: Metadata,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Create an outbound message carrying the inbound message's metadata
    /// through unchanged (e.g. Slack `thread_ts`).
    pub fn with_metadata(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata,
        }
    }
}
