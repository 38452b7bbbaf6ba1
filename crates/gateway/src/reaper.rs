//! Eviction of sessions that stopped proving liveness.

use std::{sync::Arc, time::Duration};

use {
    beacon_metrics::{counter, ws as ws_metrics},
    tracing::{debug, info, warn},
};

use crate::state::GatewayState;

/// One sweep over the registry. Sessions idle for longer than `stale_after`
/// are closed and torn down; the presence record of every user that is
/// still online is refreshed. Returns how many sessions were evicted.
pub async fn sweep(state: &GatewayState, stale_after: Duration) -> usize {
    let mut reaped = 0;
    for (user_id, sessions) in state.registry.all_users().await {
        for session in sessions {
            let idle = session.idle_for();
            if idle <= stale_after {
                continue;
            }
            info!(
                user_id,
                session_id = %session.id,
                idle_secs = idle.as_secs(),
                "evicting stale session"
            );
            if state.teardown(&session).await {
                reaped += 1;
            }
        }
    }
    if reaped > 0 {
        counter!(ws_metrics::SESSIONS_REAPED_TOTAL).increment(reaped as u64);
    }

    for user_id in state.registry.online_users().await {
        if let Err(e) = state.presence.refresh(user_id).await {
            warn!(user_id, error = %e, "failed to refresh presence record");
        }
    }
    debug!(reaped, "liveness sweep finished");
    reaped
}

/// Periodic liveness sweep.
pub async fn run_reaper(state: Arc<GatewayState>, every: Duration, stale_after: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        sweep(&state, stale_after).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::session::SessionHandle,
        beacon_config::GatewayConfig,
        beacon_store::{DurableStore, MemoryStore},
        serde_json::Value,
    };

    const STALE: Duration = Duration::from_secs(120);

    fn state() -> (Arc<MemoryStore>, Arc<GatewayState>) {
        let store = Arc::new(MemoryStore::new());
        let state = GatewayState::new(store.clone(), GatewayConfig::default());
        (store, state)
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_only_stale_sessions() {
        let (_store, state) = state();
        let (stale, _rx1) = SessionHandle::new(1, 8);
        let (fresh, _rx2) = SessionHandle::new(1, 8);
        state.connect(&stale).await;
        state.connect(&fresh).await;

        tokio::time::advance(STALE + Duration::from_secs(1)).await;
        fresh.touch();

        assert_eq!(sweep(&state, STALE).await, 1);
        assert!(stale.is_closing());
        assert!(!fresh.is_closing());
        assert_eq!(state.registry.session_count().await, 1);
        assert!(state.registry.is_online(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn last_stale_session_goes_offline_exactly_once() {
        let (store, state) = state();
        let (watcher, mut rx_watcher) = SessionHandle::new(2, 32);
        state.connect(&watcher).await;
        let (stale, _rx) = SessionHandle::new(1, 8);
        state.connect(&stale).await;

        tokio::time::advance(STALE + Duration::from_secs(1)).await;
        watcher.touch();
        assert_eq!(sweep(&state, STALE).await, 1);
        // The reader would tear down again when it notices the close.
        assert!(!state.teardown(&stale).await);
        assert_eq!(sweep(&state, STALE).await, 0);

        // Let the spawned offline task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut offline_events = 0;
        while let Ok(frame) = rx_watcher.try_recv() {
            let v: Value = serde_json::from_str(&frame).unwrap();
            if v["type"] == "user_status" && v["user_id"] == 1 && v["online"] == false {
                offline_events += 1;
            }
        }
        assert_eq!(offline_events, 1);
        assert_eq!(store.get("user:1:status").await.unwrap().as_deref(), Some("offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_presence_records_alive() {
        let (store, state) = state();
        let (session, _rx) = SessionHandle::new(1, 8);
        state.connect(&session).await;

        // Past the presence TTL, but the session keeps answering pings.
        for _ in 0..12 {
            tokio::time::advance(Duration::from_secs(30)).await;
            session.touch();
            sweep(&state, STALE).await;
        }
        assert_eq!(store.get("user:1:status").await.unwrap().as_deref(), Some("online"));
    }
}
