use std::time::Duration;

use {
    async_trait::async_trait,
    futures::StreamExt,
    redis::aio::MultiplexedConnection,
    tracing::{debug, warn},
};

use crate::{DurableStore, StoreResult, Subscription};

/// Redis-backed store.
///
/// Commands go through one multiplexed connection (cloned per call);
/// every subscription opens its own dedicated pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Open the client and establish the command connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("redis connection established");
        Ok(Self { client, conn })
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn ping(&self) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("PING").query_async::<String>(&mut conn).await?)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let applied = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn push(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<usize>(&mut conn)
            .await?)
    }

    async fn push_front(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<usize>(&mut conn)
            .await?)
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut conn)
            .await?)
    }

    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async::<usize>(&mut conn)
            .await?)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("KEYS")
            .arg(pattern)
            .query_async::<Vec<String>>(&mut conn)
            .await?)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        let topic = topic.to_string();
        let stream = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "dropping non-text pub/sub payload");
                        None
                    },
                };
                futures::future::ready(payload)
            })
            .boxed();
        Ok(stream)
    }
}
