use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::StreamExt,
    tokio::{
        sync::{Mutex, broadcast},
        time::Instant,
    },
    tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
    tracing::warn,
};

use crate::{DurableStore, StoreError, StoreResult, Subscription};

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store with lazy TTL expiry and broadcast-backed pub/sub.
///
/// Expiry follows the tokio clock, so tests can drive it with a paused
/// runtime.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining time to live of a key, if it exists and expires.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let entry = entries.get(key).filter(|e| !e.is_expired(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Apply `f` to the list at `key`, creating it if absent, and return
    /// the resulting length.
    async fn with_list(
        &self,
        key: &str,
        f: impl FnOnce(&mut VecDeque<String>),
    ) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                f(list);
                Ok(list.len())
            },
            Value::Str(_) => Err(StoreError::WrongType { key: key.into() }),
        }
    }

    async fn topic(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

/// Glob match supporting `*` only.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = candidate.strip_prefix(first) else {
        return false;
    };
    let last = rest[rest.len() - 1];
    for part in &rest[..rest.len() - 1] {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn ping(&self) -> StoreResult<String> {
        Ok("PONG".into())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());
        match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.into() }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().await.insert(key.to_string(), Entry {
            value: Value::Str(value.to_string()),
            expires_at,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn push(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.with_list(key, |list| list.push_back(value.to_string()))
            .await
    }

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.with_list(key, |list| list.push_front(value.to_string()))
            .await
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType { key: key.into() }),
        }
    }

    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());
        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::WrongType { key: key.into() });
        };
        let Some(idx) = list.iter().position(|v| v == value) else {
            return Ok(0);
        };
        list.remove(idx);
        // Redis drops empty lists.
        if list.is_empty() {
            entries.remove(key);
        }
        Ok(1)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.topic(topic).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription> {
        let rx = self.topic(topic).await.subscribe();
        let topic = topic.to_string();
        let stream = BroadcastStream::new(rx)
            .filter_map(move |item| {
                let payload = match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "subscriber lagged, messages lost");
                        None
                    },
                };
                futures::future::ready(payload)
            })
            .boxed();
        Ok(stream)
    }
}
