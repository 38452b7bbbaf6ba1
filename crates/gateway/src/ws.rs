//! Per-connection reader and writer loops.
//!
//! Each connection runs a writer task that owns the socket sink and the
//! session's outbound queue, and a reader loop on the upgrade task that owns
//! the socket stream. Whichever side stops first closes the session, which
//! wakes the other; the reader then runs the one teardown.

use std::{fmt::Display, sync::Arc, time::Duration};

use {
    axum::{
        body::Bytes,
        extract::ws::{Message, WebSocket},
    },
    beacon_protocol::UserId,
    futures::{Sink, SinkExt, Stream, StreamExt},
    tokio::{
        sync::mpsc,
        time::{Instant, timeout, timeout_at},
    },
    tracing::{debug, info},
};

use crate::{session::SessionHandle, state::GatewayState};

/// Drive one upgraded socket until either side stops.
pub async fn run_connection(socket: WebSocket, state: Arc<GatewayState>, user_id: UserId) {
    let (sink, stream) = socket.split();
    let settings = &state.settings;
    let (session, outbound) = SessionHandle::new(user_id, settings.outbound_queue_capacity);

    state.connect(&session).await;

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&session),
        settings.ping_interval(),
        settings.write_deadline(),
    ));

    read_loop(stream, &state, &session, settings.read_deadline()).await;
    state.teardown(&session).await;
    let _ = writer.await;
}

/// Read inbound frames until the peer goes away, the read deadline passes
/// or the session is closed.
///
/// The deadline is pushed back on every pong; other frames do not count as
/// liveness.
pub(crate) async fn read_loop<S>(
    mut stream: S,
    state: &GatewayState,
    session: &SessionHandle,
    read_deadline: Duration,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + read_deadline;
    loop {
        tokio::select! {
            _ = session.closed() => {
                debug!(session_id = %session.id, "session closed, reader stopping");
                break;
            },
            next = timeout_at(deadline, stream.next()) => match next {
                Err(_) => {
                    info!(session_id = %session.id, user_id = session.user_id, "read deadline expired");
                    break;
                },
                Ok(None) => {
                    debug!(session_id = %session.id, "stream ended");
                    break;
                },
                Ok(Some(Err(e))) => {
                    debug!(session_id = %session.id, error = %e, "receive error");
                    break;
                },
                Ok(Some(Ok(msg))) => match msg {
                    Message::Text(text) => state.handle_frame(session, text.as_str()).await,
                    Message::Pong(_) => {
                        session.touch();
                        deadline = Instant::now() + read_deadline;
                    },
                    Message::Close(frame) => {
                        debug!(session_id = %session.id, reason = ?frame, "client initiated close");
                        break;
                    },
                    Message::Ping(_) | Message::Binary(_) => {},
                },
            },
        }
    }
}

/// Sole consumer of the outbound queue. Writes each frame and the periodic
/// ping under `write_deadline`; a failed write closes the session.
pub(crate) async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<String>,
    session: Arc<SessionHandle>,
    ping_interval: Duration,
    write_deadline: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let msg = tokio::select! {
            _ = session.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };
        if !send_within(&mut sink, msg, write_deadline, &session).await {
            break;
        }
    }

    let _ = timeout(write_deadline, sink.send(Message::Close(None))).await;
    let _ = timeout(write_deadline, sink.close()).await;
    session.close();
}

async fn send_within<W>(sink: &mut W, msg: Message, deadline: Duration, session: &SessionHandle) -> bool
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(session_id = %session.id, error = %e, "write failed");
            false
        },
        Err(_) => {
            info!(session_id = %session.id, user_id = session.user_id, "write deadline exceeded");
            false
        },
    }
}
