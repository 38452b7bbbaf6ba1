//! Durable keyed store used by the gateway for pending messages, presence
//! records and the `new_message` ingress topic.
//!
//! The gateway only relies on the primitives of [`DurableStore`]; it never
//! runs multi-key transactions. [`RedisStore`] is the production adapter,
//! [`MemoryStore`] keeps everything in-process for tests and local runs.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use {async_trait::async_trait, futures::stream::BoxStream};

pub use {memory::MemoryStore, redis_store::RedisStore};

/// Errors surfaced by a store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("key {key} holds the wrong kind of value")]
    WrongType { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of payloads published on a topic.
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Round-trip check; returns the store's pong reply.
    async fn ping(&self) -> StoreResult<String>;

    // ---- strings ----
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Set a string value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    /// (Re)set the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // ---- lists ----
    /// Append to the tail of a list, returning the new length.
    async fn push(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// Insert at the head of a list, returning the new length.
    async fn push_front(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// Full list contents, head (oldest) first.
    async fn range(&self, key: &str) -> StoreResult<Vec<String>>;
    /// Remove the first entry equal to `value`; returns how many were removed.
    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Keys matching a glob pattern (only `*` wildcards are relied upon).
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    // ---- pub/sub ----
    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()>;
    /// Subscribe to a topic. The subscription is active once this returns.
    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription>;
}
