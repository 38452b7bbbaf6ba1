//! Presence records and ephemeral event broadcast.
//!
//! Nothing here is retried: a frame that does not fit in a session's queue
//! is simply dropped.

use std::{sync::Arc, time::Duration};

use {
    beacon_protocol::{ServerFrame, UserId, keys},
    beacon_store::{DurableStore, StoreResult},
    chrono::Utc,
    tracing::{debug, warn},
};

use crate::{
    registry::ConnectionRegistry,
    session::{SessionHandle, fan_out},
};

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn DurableStore>,
    registry: Arc<ConnectionRegistry>,
    ttl: Duration,
    receipt_ttl: Duration,
}

impl Presence {
    pub fn new(
        store: Arc<dyn DurableStore>,
        registry: Arc<ConnectionRegistry>,
        ttl: Duration,
        receipt_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            ttl,
            receipt_ttl,
        }
    }

    /// 0→1 transition: record the user online and tell everyone else.
    pub async fn went_online(&self, user_id: UserId) {
        if let Err(e) = self.mark(user_id, ONLINE).await {
            warn!(user_id, error = %e, "failed to record online status");
        }
        self.broadcast_status(user_id, true).await;
    }

    /// 1→0 transition: record the user offline and tell everyone else.
    ///
    /// The record is left alone if the user reconnected in the meantime.
    /// The offline event is always broadcast so it pairs with the earlier
    /// online event; if the user is back by then, an online event follows
    /// it so peers end on the current state.
    pub async fn went_offline(&self, user_id: UserId) {
        if self.registry.is_online(user_id).await {
            debug!(user_id, "user reconnected before offline record was written");
        } else if let Err(e) = self.mark(user_id, OFFLINE).await {
            warn!(user_id, error = %e, "failed to record offline status");
        }
        self.broadcast_status(user_id, false).await;
        if self.registry.is_online(user_id).await {
            self.broadcast_status(user_id, true).await;
        }
    }

    /// Send a newly connected session one `user_status` frame per other
    /// online user.
    pub async fn send_snapshot(&self, session: &SessionHandle) -> usize {
        let mut sent = 0;
        for user_id in self.registry.online_users().await {
            if user_id == session.user_id {
                continue;
            }
            if let Some(frame) = encode(&ServerFrame::user_status(user_id, true))
                && session.try_send(&frame)
            {
                sent += 1;
            }
        }
        sent
    }

    /// Relay an inbound typing frame, as received, to the recipient's
    /// sessions.
    pub async fn relay_typing(&self, recipient_id: UserId, raw: &str) -> usize {
        let sessions = self.registry.sessions_for(recipient_id).await;
        fan_out(&sessions, raw)
    }

    /// Tell every other user that `reader` has read `conversation_id`.
    pub async fn broadcast_read_receipt(&self, reader: UserId, conversation_id: i64) -> usize {
        match encode(&ServerFrame::read_receipt(reader, conversation_id)) {
            Some(frame) => self.broadcast_except(reader, &frame).await,
            None => 0,
        }
    }

    /// Record `delivered:<message_id>:<user_id>` for an acknowledged message.
    pub async fn record_ack(&self, user_id: UserId, message_id: &str) -> StoreResult<()> {
        let now = Utc::now().timestamp().to_string();
        self.store
            .set(
                &keys::delivered(message_id, user_id),
                &now,
                Some(self.receipt_ttl),
            )
            .await
    }

    /// Extend the online record of a user that still has sessions.
    pub async fn refresh(&self, user_id: UserId) -> StoreResult<()> {
        let key = keys::status(user_id);
        if !self.store.expire(&key, self.ttl).await? {
            // Expired or never written; recreate it.
            self.mark(user_id, ONLINE).await?;
        }
        Ok(())
    }

    async fn mark(&self, user_id: UserId, status: &str) -> StoreResult<()> {
        self.store
            .set(&keys::status(user_id), status, Some(self.ttl))
            .await
    }

    async fn broadcast_status(&self, user_id: UserId, online: bool) {
        if let Some(frame) = encode(&ServerFrame::user_status(user_id, online)) {
            let reached = self.broadcast_except(user_id, &frame).await;
            debug!(user_id, online, reached, "presence broadcast");
        }
    }

    /// Enqueue `frame` on every session of every user other than `skip`.
    pub async fn broadcast_except(&self, skip: UserId, frame: &str) -> usize {
        self.registry
            .all_users()
            .await
            .iter()
            .filter(|(user_id, _)| *user_id != skip)
            .map(|(_, sessions)| fan_out(sessions, frame))
            .sum()
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match frame.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "cannot serialize server frame");
            None
        },
    }
}
