//! Durable store key layout.

use crate::UserId;

/// Glob matching every pending list.
pub const PENDING_PATTERN: &str = "pending:*";

const PENDING_PREFIX: &str = "pending:";

/// `pending:<user>`: list of serialized messages awaiting delivery.
pub fn pending(user_id: UserId) -> String {
    format!("{PENDING_PREFIX}{user_id}")
}

/// Owner of a pending list key, if the key is one.
pub fn pending_owner(key: &str) -> Option<UserId> {
    key.strip_prefix(PENDING_PREFIX)?.parse().ok()
}

/// `user:<user>:status`: presence record.
pub fn status(user_id: UserId) -> String {
    format!("user:{user_id}:status")
}

/// `delivered:<message>:<user>`: acknowledgment record.
pub fn delivered(message_id: &str, user_id: UserId) -> String {
    format!("delivered:{message_id}:{user_id}")
}
