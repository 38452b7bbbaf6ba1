//! Metric names recorded by the gateway, plus the optional Prometheus
//! recorder.
//!
//! Recording goes through the `metrics` facade, so every call is a no-op
//! until a recorder is installed.

pub use metrics::{counter, gauge};

/// WebSocket session metrics.
pub mod ws {
    /// Sessions currently registered.
    pub const CONNECTIONS_ACTIVE: &str = "beacon_ws_connections_active";
    /// Sessions accepted since start.
    pub const CONNECTIONS_TOTAL: &str = "beacon_ws_connections_total";
    /// Frames dropped because a session's outbound queue was full or closed.
    pub const FRAMES_DROPPED_TOTAL: &str = "beacon_frames_dropped_total";
    /// Sessions evicted by the liveness reaper.
    pub const SESSIONS_REAPED_TOTAL: &str = "beacon_sessions_reaped_total";
}

/// Message delivery metrics.
pub mod delivery {
    /// Messages enqueued to at least one live session.
    pub const MESSAGES_DELIVERED_TOTAL: &str = "beacon_messages_delivered_total";
    /// Messages persisted to a pending list.
    pub const MESSAGES_QUEUED_TOTAL: &str = "beacon_messages_queued_total";
    /// Published payloads that failed to decode.
    pub const DECODE_ERRORS_TOTAL: &str = "beacon_decode_errors_total";
    /// Pending entries redelivered by reconciliation.
    pub const PENDING_RECONCILED_TOTAL: &str = "beacon_pending_reconciled_total";
}

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

/// Install the global Prometheus recorder and return a handle for rendering
/// the scrape output.
#[cfg(feature = "prometheus")]
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("install prometheus recorder: {e}"))
}
