use std::{collections::HashMap, sync::Arc};

use {beacon_protocol::UserId, tokio::sync::RwLock, tracing::debug};

use crate::session::SessionHandle;

/// Live sessions grouped by user.
///
/// A user is present as a key exactly while it has at least one session.
/// Writers hold the lock only for work proportional to one user's sessions;
/// readers get cloned snapshots and may race with removal, which
/// [`SessionHandle::try_send`] tolerates.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: RwLock<HashMap<UserId, Vec<Arc<SessionHandle>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns true if it is the user's first live
    /// session (the user just came online).
    pub async fn add(&self, session: Arc<SessionHandle>) -> bool {
        let mut users = self.users.write().await;
        let sessions = users.entry(session.user_id).or_default();
        let first = sessions.is_empty();
        sessions.push(Arc::clone(&session));
        debug!(
            user_id = session.user_id,
            session_id = %session.id,
            connections = sessions.len(),
            "session registered"
        );
        first
    }

    /// Unregister a session by id. Returns true if that was the user's last
    /// session (the user just went offline). Unknown sessions return false.
    pub async fn remove(&self, session: &SessionHandle) -> bool {
        let mut users = self.users.write().await;
        let Some(sessions) = users.get_mut(&session.user_id) else {
            return false;
        };
        let Some(idx) = sessions.iter().position(|s| s.id == session.id) else {
            return false;
        };
        sessions.remove(idx);
        if sessions.is_empty() {
            users.remove(&session.user_id);
            debug!(user_id = session.user_id, "user fully disconnected");
            return true;
        }
        false
    }

    /// Snapshot of a user's sessions, oldest first.
    pub async fn sessions_for(&self, user_id: UserId) -> Vec<Arc<SessionHandle>> {
        self.users
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every user with their sessions.
    pub async fn all_users(&self) -> Vec<(UserId, Vec<Arc<SessionHandle>>)> {
        self.users
            .read()
            .await
            .iter()
            .map(|(user, sessions)| (*user, sessions.clone()))
            .collect()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    /// Online users in ascending id order.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.read().await.keys().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.users.read().await.values().map(Vec::len).sum()
    }
}
