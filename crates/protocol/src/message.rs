use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::UserId;

/// Default value of the `type` field for chat content.
pub const DEFAULT_MESSAGE_TYPE: &str = "message";

/// A chat message as published by the producer and delivered to clients.
///
/// Missing numeric fields decode as `0` and a missing `type` as `"message"`.
/// Any extra top-level fields (listing summaries, sender cards, ...) are kept
/// in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: i64,
    /// Sender.
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub recipient_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type", default = "default_message_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

impl Message {
    pub fn new(
        sender: UserId,
        recipient: UserId,
        conversation_id: i64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: fallback_message_id(),
            conversation_id,
            user_id: sender,
            recipient_id: recipient,
            content: content.into(),
            created_at: Utc::now(),
            kind: default_message_type(),
            delivered_at: None,
            extra: Map::new(),
        }
    }

    /// Fill in the id and type when the producer left them blank.
    pub fn normalize(&mut self) {
        if self.message_id.is_empty() {
            self.message_id = fallback_message_id();
        }
        if self.kind.is_empty() {
            self.kind = default_message_type();
        }
    }
}

/// Time-based id used when the producer did not supply one: `msg_<unix nanos>`.
pub fn fallback_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("msg_{nanos}")
}
