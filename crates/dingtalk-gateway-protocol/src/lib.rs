//! Wire types shared between the DingTalk stream gateway and its consumers.
//!
//! Three layers live here:
//!
//! - **Stream layer**: [`StreamFrame`] and [`Ack`], the envelope DingTalk pushes
//!   over a stream connection and the acknowledgment sent back for it.
//! - **Payload layer**: [`RawEvent`], the robot message carried in a callback
//!   frame's `data` field.
//! - **Gateway layer**: [`InboundMessage`] and [`GatewayEvent`], the normalized
//!   record handed to downstream processing and its JSON Lines framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic DingTalk uses for robot message callbacks.
pub const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// `conversationType` value for group chats (`"1"` is a direct chat).
const GROUP_CONVERSATION: &str = "2";

// ============================================================================
// Stream layer
// ============================================================================

/// A single frame delivered over a stream connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<String>,
    /// `CALLBACK`, `EVENT` or `SYSTEM`.
    #[serde(rename = "type")]
    pub frame_type: String,
    pub headers: FrameHeaders,
    /// JSON-encoded payload. For robot callbacks this decodes to a [`RawEvent`].
    #[serde(default)]
    pub data: String,
}

/// Delivery metadata attached to a [`StreamFrame`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeaders {
    pub topic: String,
    /// Transport-assigned delivery id. Redeliveries of the same event reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Acknowledgment returned to the transport for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub code: u16,
    pub message: String,
    pub message_id: Option<String>,
}

impl Ack {
    pub const OK: u16 = 200;

    /// The success acknowledgment. The gateway never returns anything else.
    pub fn success(message_id: Option<String>) -> Self {
        Self {
            code: Self::OK,
            message: "OK".to_string(),
            message_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::OK
    }

    /// Render the ack frame written back on the stream connection.
    pub fn to_frame(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code,
            "headers": {
                "contentType": "application/json",
                "messageId": self.message_id,
            },
            "message": self.message,
            "data": serde_json::json!({ "response": null }).to_string(),
        })
    }
}

// ============================================================================
// Payload layer
// ============================================================================

/// A robot message as delivered by DingTalk.
///
/// `senderId` and `conversationId` are required; everything else is optional
/// because DingTalk omits fields depending on message type and chat kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RichContent>,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_staff_id: Option<String>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub at_users: Vec<AtUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_code: Option<String>,
    /// Identifier embedded in the payload body. A delivery-level id wins over it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_webhook: Option<String>,
    /// Creation time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub content: String,
}

/// Non-text content. Only speech recognition output is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtUser {
    #[serde(alias = "dingtalkId")]
    pub id: String,
}

impl RawEvent {
    /// Normalized text content, trimmed.
    ///
    /// Text messages use `text.content`; anything else falls back to the
    /// recognized content (voice), then to the empty string.
    pub fn text(&self) -> &str {
        let structured = if self.msgtype == "text" {
            self.text.as_ref().map(|t| t.content.as_str())
        } else {
            None
        };
        structured
            .or_else(|| self.content.as_ref()?.recognition.as_deref())
            .unwrap_or("")
            .trim()
    }
}

// ============================================================================
// Gateway layer
// ============================================================================

/// A unique inbound message, normalized for downstream processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub msg_type: String,
    /// Trimmed text; empty for content without a text rendering.
    pub text: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_staff_id: Option<String>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_webhook: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Normalize a raw event.
    ///
    /// `delivery_id` is the transport-level message id; when present it
    /// replaces the id embedded in the payload.
    pub fn from_raw(account_id: &str, raw: RawEvent, delivery_id: Option<String>) -> Self {
        let text = raw.text().to_string();
        Self {
            account_id: account_id.to_string(),
            message_id: delivery_id.or(raw.msg_id),
            msg_type: raw.msgtype,
            text,
            sender_id: raw.sender_id,
            sender_nick: raw.sender_nick,
            sender_staff_id: raw.sender_staff_id,
            conversation_id: raw.conversation_id,
            conversation_type: raw.conversation_type,
            conversation_title: raw.conversation_title,
            mentions: raw.at_users.into_iter().map(|u| u.id).collect(),
            robot_code: raw.robot_code,
            session_webhook: raw.session_webhook,
            received_at: Utc::now(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.conversation_type.as_deref() == Some(GROUP_CONVERSATION)
    }
}

/// Events written by the gateway subprocess, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    MessageReceived(InboundMessage),
    Disconnected { account_id: String, reason: String },
}
