// WebSocket endpoint: one connection per upgraded request, bound to the
// document named by the request path.

pub mod connection;
pub mod handler;

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

pub use connection::{ConnectionSettings, Heartbeat, HeartbeatAction};

use crate::sync::SessionRegistry;

/// Largest inbound message accepted on a connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct WsState {
    registry: Arc<SessionRegistry>,
    settings: ConnectionSettings,
}

pub fn router(registry: Arc<SessionRegistry>, settings: ConnectionSettings) -> Router {
    Router::new()
        .route("/", get(missing_doc_name))
        .route("/{*doc_name}", get(ws_upgrade))
        .with_state(WsState { registry, settings })
}

async fn missing_doc_name() -> Response {
    (StatusCode::BAD_REQUEST, "document name missing from request path").into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(doc_name): Path<String>,
    State(state): State<WsState>,
) -> Response {
    if doc_name.is_empty() {
        return missing_doc_name().await;
    }

    ws.max_message_size(MAX_FRAME_BYTES).max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| {
        connection::serve_connection(socket, doc_name, state.registry, state.settings)
    })
}
