// Lifecycle of one WebSocket connection: attach to a session, pump frames,
// heartbeat, and the close path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::handler;
use crate::metrics;
use crate::sync::{ConnectionId, Outbound, SessionHandle, SessionRegistry, OUTBOUND_QUEUE_CAPACITY};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
}

/// Liveness tracking between heartbeat ticks.
///
/// A connection that has not answered the previous ping by the next tick is
/// terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pong_received: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ping,
    Terminate,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { pong_received: true }
    }
}

impl Heartbeat {
    pub fn on_tick(&mut self) -> HeartbeatAction {
        if !self.pong_received {
            return HeartbeatAction::Terminate;
        }
        self.pong_received = false;
        HeartbeatAction::Ping
    }

    pub fn on_pong(&mut self) {
        self.pong_received = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    HeartbeatTimeout,
    TransportError,
    Detached,
}

/// Attach a new connection to the session for `doc_name` and queue its
/// handshake.
///
/// A session evicted between lookup and lock is never joined; the registry is
/// asked again and hands out a fresh one.
pub async fn setup_connection(
    registry: &Arc<SessionRegistry>,
    doc_name: &str,
    connection_id: ConnectionId,
    outbound: Outbound,
) -> Result<SessionHandle> {
    loop {
        let handle = registry.get_or_create(doc_name).await?;
        let mut session = handle.lock().await;
        if session.is_evicted() {
            continue;
        }
        session.add_connection(connection_id, outbound.clone());
        drop(session);
        return Ok(handle);
    }
}

/// Run the close path for `connection_id`. Safe to call more than once.
pub async fn close_connection(session: &SessionHandle, connection_id: ConnectionId) -> bool {
    session.lock().await.remove_connection(connection_id)
}

/// Serve one upgraded socket until it closes.
pub async fn serve_connection(
    mut socket: WebSocket,
    doc_name: String,
    registry: Arc<SessionRegistry>,
    settings: ConnectionSettings,
) {
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_CAPACITY);

    let session = match setup_connection(&registry, &doc_name, connection_id, outbound_tx).await {
        Ok(session) => session,
        Err(error) => {
            warn!(doc = %doc_name, connection_id, ?error, "failed to attach connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    metrics::record_connection_opened();
    debug!(doc = %doc_name, connection_id, "connection opened");

    let mut heartbeat = Heartbeat::default();
    let mut heartbeat_interval = tokio::time::interval(settings.ping_interval);
    heartbeat_interval.reset(); // skip immediate first tick

    let reason = loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                match heartbeat.on_tick() {
                    HeartbeatAction::Terminate => {
                        metrics::record_heartbeat_timeout();
                        break CloseReason::HeartbeatTimeout;
                    }
                    HeartbeatAction::Ping => {
                        if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break CloseReason::TransportError;
                        }
                    }
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if socket.send(Message::Binary(frame.into())).await.is_err() {
                            break CloseReason::TransportError;
                        }
                    }
                    None => break CloseReason::Detached,
                }
            }
            maybe_message = socket.recv() => {
                match maybe_message {
                    Some(Ok(Message::Binary(payload))) => {
                        let mut session = session.lock().await;
                        handler::handle_frame(&mut session, connection_id, &payload);
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Ok(Message::Ping(_) | Message::Text(_))) => {}
                    Some(Err(error)) => {
                        debug!(doc = %doc_name, connection_id, ?error, "websocket receive failed");
                        break CloseReason::TransportError;
                    }
                }
            }
        }
    };

    close_connection(&session, connection_id).await;
    metrics::record_connection_closed();
    match reason {
        CloseReason::HeartbeatTimeout => {
            info!(doc = %doc_name, connection_id, "heartbeat timeout, disconnecting");
        }
        other => debug!(doc = %doc_name, connection_id, reason = ?other, "connection closed"),
    }

    if reason != CloseReason::ClientClosed {
        let _ = socket.send(Message::Close(None)).await;
    }
}
