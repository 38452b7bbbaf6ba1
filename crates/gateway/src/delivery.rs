//! Live fan-out of published messages, with durable fallback.

use std::{sync::Arc, time::Duration};

use {
    beacon_metrics::{counter, delivery as delivery_metrics},
    beacon_protocol::{Message, NEW_MESSAGE_TOPIC},
    beacon_store::{DurableStore, StoreResult},
    futures::StreamExt,
    tracing::{debug, error, info, warn},
};

use crate::{pending::PendingQueue, registry::ConnectionRegistry, session::fan_out};

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// At least one live session accepted it.
    Delivered,
    /// No session accepted it; it was written to the recipient's pending list.
    Queued,
}

pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingQueue>,
}

impl DeliveryEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, pending: Arc<PendingQueue>) -> Self {
        Self { registry, pending }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Enqueue a message on every live session of its recipient.
    ///
    /// Returns true if at least one session accepted it. Nothing is
    /// persisted here.
    pub async fn deliver(&self, message: &Message) -> bool {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "cannot serialize message");
                return false;
            },
        };
        let sessions = self.registry.sessions_for(message.recipient_id).await;
        if sessions.is_empty() {
            debug!(recipient_id = message.recipient_id, "recipient offline");
            return false;
        }
        let accepted = fan_out(&sessions, &frame);
        if accepted > 0 {
            counter!(delivery_metrics::MESSAGES_DELIVERED_TOTAL).increment(1);
            debug!(
                message_id = %message.message_id,
                recipient_id = message.recipient_id,
                sessions = accepted,
                "message delivered"
            );
        }
        accepted > 0
    }

    /// Deliver, or save to the pending list when no session accepted it.
    pub async fn dispatch(&self, message: &Message) -> StoreResult<DeliveryOutcome> {
        if self.deliver(message).await {
            return Ok(DeliveryOutcome::Delivered);
        }
        self.pending.save(message).await?;
        info!(
            message_id = %message.message_id,
            recipient_id = message.recipient_id,
            "recipient unreachable, message queued"
        );
        Ok(DeliveryOutcome::Queued)
    }

    /// Handle one payload from the ingress topic. Undecodable payloads are
    /// logged and skipped.
    pub async fn handle_published(&self, payload: &str) -> Option<DeliveryOutcome> {
        let mut message: Message = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding undecodable published message");
                counter!(delivery_metrics::DECODE_ERRORS_TOTAL).increment(1);
                return None;
            },
        };
        message.normalize();
        match self.dispatch(&message).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    recipient_id = message.recipient_id,
                    error = %e,
                    "failed to save undeliverable message"
                );
                None
            },
        }
    }
}

// ── Ingress subscriber ───────────────────────────────────────────────────────

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Subscribe to the ingress topic and spawn the task that feeds it into
/// `engine`, in receipt order.
///
/// The first subscription happens before this returns, so a store that is
/// down at startup is reported to the caller. Later stream ends are retried
/// with exponential backoff capped at `max_backoff`.
pub async fn spawn_subscriber(
    store: Arc<dyn DurableStore>,
    engine: Arc<DeliveryEngine>,
    max_backoff: Duration,
) -> StoreResult<tokio::task::JoinHandle<()>> {
    let first = store.subscribe(NEW_MESSAGE_TOPIC).await?;
    info!(topic = NEW_MESSAGE_TOPIC, "subscribed to message topic");

    Ok(tokio::spawn(async move {
        let mut stream = first;
        loop {
            while let Some(payload) = stream.next().await {
                engine.handle_published(&payload).await;
            }
            warn!(topic = NEW_MESSAGE_TOPIC, "message subscription ended");
            stream = resubscribe(store.as_ref(), max_backoff).await;
        }
    }))
}

async fn resubscribe(store: &dyn DurableStore, max_backoff: Duration) -> beacon_store::Subscription {
    let mut delay = INITIAL_BACKOFF.min(max_backoff);
    loop {
        tokio::time::sleep(delay).await;
        match store.subscribe(NEW_MESSAGE_TOPIC).await {
            Ok(stream) => {
                info!(topic = NEW_MESSAGE_TOPIC, "resubscribed to message topic");
                return stream;
            },
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "resubscribe failed");
                delay = (delay * 2).min(max_backoff);
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::session::SessionHandle,
        beacon_protocol::UserId,
        beacon_store::MemoryStore,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingQueue>,
        engine: Arc<DeliveryEngine>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let pending = Arc::new(PendingQueue::new(
            store.clone(),
            Duration::from_secs(3600),
        ));
        let engine = Arc::new(DeliveryEngine::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
        ));
        Fixture {
            store,
            registry,
            pending,
            engine,
        }
    }

    fn message(to: UserId) -> Message {
        Message::new(1, to, 3, "hello")
    }

    #[tokio::test]
    async fn multicasts_to_every_session_of_the_recipient() {
        let f = fixture();
        let (a1, mut rx1) = SessionHandle::new(2, 4);
        let (a2, mut rx2) = SessionHandle::new(2, 4);
        let (other, mut rx_other) = SessionHandle::new(9, 4);
        for s in [&a1, &a2, &other] {
            f.registry.add(Arc::clone(s)).await;
        }

        let m = message(2);
        assert_eq!(f.engine.dispatch(&m).await.unwrap(), DeliveryOutcome::Delivered);
        for rx in [&mut rx1, &mut rx2] {
            let got: Message = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(got.message_id, m.message_id);
        }
        assert!(rx_other.try_recv().is_err());
        assert_eq!(f.pending.count(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_recipient_gets_a_pending_entry() {
        let f = fixture();
        let m = message(2);
        assert!(!f.engine.deliver(&m).await);
        assert_eq!(f.engine.dispatch(&m).await.unwrap(), DeliveryOutcome::Queued);

        let stored: Message = serde_json::from_str(&f.pending.list(2).await.unwrap()[0]).unwrap();
        assert_eq!(stored, m);
    }

    #[tokio::test]
    async fn all_sessions_full_falls_back_to_pending() {
        let f = fixture();
        let (a, _rx) = SessionHandle::new(2, 1);
        assert!(a.try_send("filler"));
        f.registry.add(Arc::clone(&a)).await;

        assert_eq!(f.engine.dispatch(&message(2)).await.unwrap(), DeliveryOutcome::Queued);
        assert_eq!(f.pending.count(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn one_open_session_is_enough() {
        let f = fixture();
        let (full, _rx_full) = SessionHandle::new(2, 1);
        assert!(full.try_send("filler"));
        let (open, mut rx_open) = SessionHandle::new(2, 1);
        f.registry.add(Arc::clone(&full)).await;
        f.registry.add(Arc::clone(&open)).await;

        assert!(f.engine.deliver(&message(2)).await);
        assert!(rx_open.try_recv().is_ok());
    }

    #[tokio::test]
    async fn published_payloads_are_normalized_and_garbage_skipped() {
        let f = fixture();
        assert_eq!(f.engine.handle_published("not json").await, None);

        let outcome = f
            .engine
            .handle_published(r#"{"recipient_id":4,"user_id":1,"content":"hi","type":""}"#)
            .await;
        assert_eq!(outcome, Some(DeliveryOutcome::Queued));

        let stored: Message = serde_json::from_str(&f.pending.list(4).await.unwrap()[0]).unwrap();
        assert!(stored.message_id.starts_with("msg_"));
        assert_eq!(stored.kind, "message");
    }

    #[tokio::test]
    async fn subscriber_feeds_published_messages_in_order() {
        let f = fixture();
        let (session, mut rx) = SessionHandle::new(2, 16);
        f.registry.add(Arc::clone(&session)).await;

        let task = spawn_subscriber(
            f.store.clone(),
            Arc::clone(&f.engine),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        for i in 0..3 {
            let mut m = message(2);
            m.message_id = format!("m{i}");
            f.store
                .publish(NEW_MESSAGE_TOPIC, &serde_json::to_string(&m).unwrap())
                .await
                .unwrap();
        }

        let mut ids = Vec::new();
        while ids.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            ids.push(serde_json::from_str::<Message>(&frame).unwrap().message_id);
        }
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
        task.abort();
    }
}
