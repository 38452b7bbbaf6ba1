use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Deserializer, Serialize, de::Error as _},
};

use crate::UserId;

// ── Client → gateway ─────────────────────────────────────────────────────────

/// A frame received from a connected client, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// The client received a message.
    Ack { message_id: String },
    /// The client is typing to `recipient_id`.
    Typing {
        #[serde(deserialize_with = "lenient_user_id")]
        recipient_id: UserId,
        #[serde(default)]
        conversation_id: Option<i64>,
    },
    /// The client has read a conversation.
    Read { conversation_id: i64 },
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Accept an id sent as an integer or as a whole float such as `2.0`.
fn lenient_user_id<'de, D: Deserializer<'de>>(de: D) -> Result<UserId, D::Error> {
    let number = serde_json::Number::deserialize(de)?;
    if let Some(id) = number.as_i64() {
        return Ok(id);
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(f as i64),
        _ => Err(D::Error::custom(format!("invalid user id {number}"))),
    }
}

// ── Gateway → client ─────────────────────────────────────────────────────────

/// Events generated by the gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    UserStatus {
        user_id: UserId,
        online: bool,
    },
    ReadReceipt {
        user_id: UserId,
        conversation_id: i64,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn user_status(user_id: UserId, online: bool) -> Self {
        Self::UserStatus { user_id, online }
    }

    pub fn read_receipt(user_id: UserId, conversation_id: i64) -> Self {
        Self::ReadReceipt {
            user_id,
            conversation_id,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
