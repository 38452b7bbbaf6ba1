use std::sync::Arc;

use {
    beacon_config::GatewayConfig,
    beacon_metrics::{counter, gauge, ws as ws_metrics},
    beacon_protocol::ClientFrame,
    beacon_store::{DurableStore, StoreResult},
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use crate::{
    delivery::{self, DeliveryEngine},
    pending::{self, PendingQueue},
    presence::Presence,
    reaper,
    registry::ConnectionRegistry,
    session::SessionHandle,
};

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, held behind an `Arc` by every connection
/// and background task.
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn DurableStore>,
    pub delivery: Arc<DeliveryEngine>,
    pub pending: Arc<PendingQueue>,
    pub presence: Presence,
    pub settings: GatewayConfig,
    pub version: String,
}

impl GatewayState {
    pub fn new(store: Arc<dyn DurableStore>, settings: GatewayConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let pending = Arc::new(PendingQueue::new(
            Arc::clone(&store),
            settings.pending_ttl(),
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
        ));
        let presence = Presence::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            settings.presence_ttl(),
            settings.pending_ttl(),
        );
        Arc::new(Self {
            registry,
            store,
            delivery,
            pending,
            presence,
            settings,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Register a freshly upgraded session: announce the user if this is
    /// its first session, send the presence snapshot, then drain the user's
    /// pending list into the session.
    pub async fn connect(&self, session: &Arc<SessionHandle>) {
        let first = self.registry.add(Arc::clone(session)).await;
        gauge!(ws_metrics::CONNECTIONS_ACTIVE).increment(1.0);
        counter!(ws_metrics::CONNECTIONS_TOTAL).increment(1);
        info!(
            user_id = session.user_id,
            session_id = %session.id,
            first,
            "session connected"
        );

        if first {
            self.presence.went_online(session.user_id).await;
        }
        self.presence.send_snapshot(session).await;
        if let Err(e) = self.pending.drain_on_connect(session).await {
            warn!(user_id = session.user_id, error = %e, "failed to drain pending messages");
        }
    }

    /// The single teardown path for a session. Closes it, removes it from
    /// the registry and, if it was the user's last session, announces the
    /// user offline from a spawned task.
    ///
    /// Only the first call per session does anything; it returns true.
    pub async fn teardown(&self, session: &SessionHandle) -> bool {
        if !session.begin_teardown() {
            return false;
        }
        session.close();
        let now_empty = self.registry.remove(session).await;
        gauge!(ws_metrics::CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            user_id = session.user_id,
            session_id = %session.id,
            connected_secs = session.connected_at.elapsed().as_secs(),
            "session closed"
        );

        if now_empty {
            let presence = self.presence.clone();
            let user_id = session.user_id;
            tokio::spawn(async move {
                presence.went_offline(user_id).await;
            });
        }
        true
    }

    /// Dispatch one inbound text frame from `session`.
    pub async fn handle_frame(&self, session: &SessionHandle, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "discarding malformed frame");
                return;
            },
        };
        match frame {
            ClientFrame::Ack { message_id } => {
                debug!(user_id = session.user_id, message_id = %message_id, "ack");
                if let Err(e) = self.presence.record_ack(session.user_id, &message_id).await {
                    warn!(message_id = %message_id, error = %e, "failed to record delivery receipt");
                }
            },
            ClientFrame::Typing { recipient_id, .. } => {
                self.presence.relay_typing(recipient_id, text).await;
            },
            ClientFrame::Read { conversation_id } => {
                self.presence
                    .broadcast_read_receipt(session.user_id, conversation_id)
                    .await;
            },
            ClientFrame::Unknown => {
                debug!(session_id = %session.id, "ignoring frame of unknown type");
            },
        }
    }

    /// Close every live session. Their readers run the usual teardown.
    pub async fn close_all(&self) {
        for (_, sessions) in self.registry.all_users().await {
            for session in sessions {
                session.close();
            }
        }
    }

    /// Start the ingress subscriber, the liveness reaper and the pending
    /// reconciler. Fails only if the first subscription fails.
    pub async fn spawn_background_tasks(self: &Arc<Self>) -> StoreResult<Vec<JoinHandle<()>>> {
        let subscriber = delivery::spawn_subscriber(
            Arc::clone(&self.store),
            Arc::clone(&self.delivery),
            self.settings.resubscribe_max_backoff(),
        )
        .await?;
        let reaper = tokio::spawn(reaper::run_reaper(
            Arc::clone(self),
            self.settings.reap_interval(),
            self.settings.stale_after(),
        ));
        let reconciler = tokio::spawn(pending::run_reconciler(
            Arc::clone(&self.pending),
            Arc::clone(&self.delivery),
            self.settings.reconcile_interval(),
        ));
        Ok(vec![subscriber, reaper, reconciler])
    }
}
