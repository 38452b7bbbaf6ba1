//! Wire protocol shared by the gateway, the CLI and external producers.
//!
//! Everything on the wire is JSON text:
//! - chat content travels as a serialized [`Message`], both on the
//!   `new_message` topic and on client connections;
//! - clients send [`ClientFrame`]s (`ack`, `typing`, `read`);
//! - the gateway emits [`ServerFrame`]s for presence and read receipts and
//!   relays typing frames as received.

pub mod frames;
pub mod keys;
pub mod message;

pub use {
    frames::{ClientFrame, ServerFrame},
    message::Message,
};

/// Numeric user identity as carried in every frame and store key.
pub type UserId = i64;

/// Topic the external producer publishes chat messages on.
pub const NEW_MESSAGE_TOPIC: &str = "new_message";

/// Default capacity of a session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Interval between server pings on an idle connection.
pub const PING_INTERVAL_SECS: u64 = 54;

/// A connection must prove liveness (pong) within this window.
pub const READ_DEADLINE_SECS: u64 = 60;

/// Upper bound on a single frame write.
pub const WRITE_DEADLINE_SECS: u64 = 10;

/// How often the reaper sweeps the registry.
pub const REAP_INTERVAL_SECS: u64 = 30;

/// Sessions silent for longer than this are evicted by the reaper.
pub const STALE_AFTER_SECS: u64 = 120;

/// How often pending lists of online users are redelivered.
pub const RECONCILE_INTERVAL_SECS: u64 = 300;

/// Retention of pending messages and delivery receipts (7 days).
pub const PENDING_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// TTL of the presence record; refreshed while the user stays online.
pub const PRESENCE_TTL_SECS: u64 = 5 * 60;
