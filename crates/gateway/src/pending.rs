//! Durable per-user queue of messages that could not be delivered live.
//!
//! Entries are serialized [`Message`]s appended to `pending:<user>`, so the
//! list reads oldest first. Every removal is by value: a drain and a
//! reconciliation pass may work on the same list at once, and each entry is
//! claimed (removed) before it is handed to a session, so only one of them
//! ever delivers it.

use std::{sync::Arc, time::Duration};

use {
    beacon_metrics::{counter, delivery as delivery_metrics},
    beacon_protocol::{Message, UserId, keys},
    beacon_store::{DurableStore, StoreResult},
    tracing::{debug, error, info, warn},
};

use crate::{delivery::DeliveryEngine, session::SessionHandle};

/// Write-back attempts for a claimed entry that was not delivered.
const RESTORE_ATTEMPTS: usize = 3;

pub struct PendingQueue {
    store: Arc<dyn DurableStore>,
    ttl: Duration,
}

/// Result of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending lists whose owner was online.
    pub users: usize,
    pub delivered: usize,
    /// Entries still in the list because delivery failed again.
    pub retained: usize,
}

impl PendingQueue {
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist a message for its recipient and refresh the list's retention.
    pub async fn save(&self, message: &Message) -> StoreResult<()> {
        let entry = match serde_json::to_string(message) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "cannot serialize message for pending list");
                return Ok(());
            },
        };
        self.save_entry(message.recipient_id, &entry).await
    }

    async fn save_entry(&self, user_id: UserId, entry: &str) -> StoreResult<()> {
        let key = keys::pending(user_id);
        self.store.push(&key, entry).await?;
        self.store.expire(&key, self.ttl).await?;
        counter!(delivery_metrics::MESSAGES_QUEUED_TOTAL).increment(1);
        Ok(())
    }

    /// Raw pending entries for a user, oldest first.
    pub async fn list(&self, user_id: UserId) -> StoreResult<Vec<String>> {
        self.store.range(&keys::pending(user_id)).await
    }

    pub async fn count(&self, user_id: UserId) -> StoreResult<usize> {
        Ok(self.list(user_id).await?.len())
    }

    /// Hand a newly registered session everything stored for its user,
    /// oldest to newest, then clear what was read.
    ///
    /// Entries that do not fit in the session's queue are dropped, not
    /// re-queued. Entries appended while draining stay in the list.
    /// Returns how many entries were enqueued.
    pub async fn drain_on_connect(&self, session: &SessionHandle) -> StoreResult<usize> {
        let key = keys::pending(session.user_id);
        let entries = self.store.range(&key).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        info!(
            user_id = session.user_id,
            count = entries.len(),
            "delivering pending messages"
        );

        let mut enqueued = 0;
        for entry in &entries {
            if self.store.remove(&key, entry).await? == 0 {
                // Claimed by a concurrent reconciliation pass.
                continue;
            }
            if session.try_send(entry) {
                enqueued += 1;
            } else {
                warn!(session_id = %session.id, "could not deliver pending message");
            }
        }
        Ok(enqueued)
    }

    /// Redeliver the pending lists of every user who is currently online.
    ///
    /// Each entry is claimed before delivery. Claimed entries that no session
    /// took are put back at the head of the list, in their original order,
    /// so they still drain before anything saved during the pass. A store
    /// failure on one user's list is logged and the pass moves on.
    pub async fn reconcile(&self, delivery: &DeliveryEngine) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for key in self.store.keys(keys::PENDING_PATTERN).await? {
            let Some(user_id) = keys::pending_owner(&key) else {
                continue;
            };
            if !delivery.registry().is_online(user_id).await {
                continue;
            }
            report.users += 1;

            let entries = match self.store.range(&key).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(key = %key, error = %e, "cannot read pending list");
                    continue;
                },
            };
            let mut unsent = Vec::new();
            for entry in entries {
                let message: Message = match serde_json::from_str(&entry) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(key = %key, error = %e, "undecodable pending entry left in place");
                        report.retained += 1;
                        continue;
                    },
                };
                match self.store.remove(&key, &entry).await {
                    Ok(0) => continue,
                    Ok(_) => {},
                    Err(e) => {
                        warn!(key = %key, error = %e, "cannot claim pending entry");
                        break;
                    },
                }
                if delivery.deliver(&message).await {
                    report.delivered += 1;
                } else {
                    unsent.push(entry);
                }
            }
            report.retained += unsent.len();
            self.restore(&key, &unsent).await;
        }
        if report.delivered > 0 {
            counter!(delivery_metrics::PENDING_RECONCILED_TOTAL).increment(report.delivered as u64);
        }
        debug!(?report, "pending reconciliation finished");
        Ok(report)
    }

    /// Put claimed entries back at the head of `key`, keeping their order.
    ///
    /// Never stops early: every entry gets its own attempts even if an
    /// earlier one could not be written back.
    async fn restore(&self, key: &str, entries: &[String]) {
        if entries.is_empty() {
            return;
        }
        for entry in entries.iter().rev() {
            let mut attempt = 1;
            while let Err(e) = self.store.push_front(key, entry).await {
                if attempt == RESTORE_ATTEMPTS {
                    error!(key, entry = %entry, error = %e, "lost pending entry, could not put it back");
                    break;
                }
                warn!(key, attempt, error = %e, "retrying pending entry restore");
                attempt += 1;
            }
        }
        if let Err(e) = self.store.expire(key, self.ttl).await {
            warn!(key, error = %e, "cannot refresh pending list retention");
        }
    }
}

/// Periodic reconciliation loop.
pub async fn run_reconciler(
    pending: Arc<PendingQueue>,
    delivery: Arc<DeliveryEngine>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        match pending.reconcile(&delivery).await {
            Ok(report) if report.delivered > 0 => {
                info!(
                    users = report.users,
                    delivered = report.delivered,
                    retained = report.retained,
                    "redelivered pending messages"
                );
            },
            Ok(_) => {},
            Err(e) => warn!(error = %e, "pending reconciliation failed"),
        }
    }
}
