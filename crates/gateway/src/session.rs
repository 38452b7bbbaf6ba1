use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    beacon_metrics::{counter, ws as ws_metrics},
    beacon_protocol::UserId,
    tokio::{
        sync::mpsc::{self, error::TrySendError},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

// ── Session handle ───────────────────────────────────────────────────────────

/// The shared half of one live client connection.
///
/// The registry, the delivery engine and the broadcaster only ever hold this
/// handle. The physical socket is owned by the connection's reader and writer
/// loops; they consume the receiving end of `outbound` and watch `closing`.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub user_id: UserId,
    pub connected_at: Instant,
    outbound: mpsc::Sender<String>,
    /// Milliseconds after `connected_at` of the last liveness proof.
    last_seen_ms: AtomicU64,
    closing: CancellationToken,
    torn_down: AtomicBool,
}

impl SessionHandle {
    /// Create a handle with a bounded outbound queue of `capacity` frames.
    /// The receiver belongs to the connection's writer loop.
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            connected_at: Instant::now(),
            outbound: tx,
            last_seen_ms: AtomicU64::new(0),
            closing: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        });
        (handle, rx)
    }

    /// Non-blocking enqueue of one serialized frame.
    ///
    /// A full or closed queue drops the frame and returns false; the drop is
    /// only visible in logs and metrics.
    pub fn try_send(&self, frame: &str) -> bool {
        match self.outbound.try_send(frame.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, user_id = self.user_id, "send buffer full, frame dropped");
                counter!(ws_metrics::FRAMES_DROPPED_TOTAL).increment(1);
                false
            },
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.id, user_id = self.user_id, "send on closed session");
                counter!(ws_metrics::FRAMES_DROPPED_TOTAL).increment(1);
                false
            },
        }
    }

    /// Record a liveness proof (pong) now.
    pub fn touch(&self) {
        let ms = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Time since the last liveness proof (or since connect).
    pub fn idle_for(&self) -> Duration {
        let last_seen =
            self.connected_at + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last_seen)
    }

    /// Ask both connection loops to stop. Idempotent.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    /// Claim the one teardown for this session. Only the first caller gets
    /// true.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

/// Enqueue `frame` on every session, returning how many accepted it.
pub fn fan_out<'a>(sessions: impl IntoIterator<Item = &'a Arc<SessionHandle>>, frame: &str) -> usize {
    sessions
        .into_iter()
        .filter(|session| session.try_send(frame))
        .count()
}
