//! WebSocket transport.
//!
//! One JSON envelope per text message; binary frames are ignored, pings are
//! answered by axum. The HTTP surface is a two-route router: `/ws` for the
//! upgrade and `/healthz` for liveness probes.

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::connection;
use crate::state::AppState;
use crate::transport::{Transport, TransportError};

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "ws: receive failed");
                    return None;
                }
            }
        }
    }
}

// =============================================================================
// HTTP SURFACE
// =============================================================================

#[must_use]
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        connection::run(state, WsTransport::new(socket)).await;
    })
}

async fn healthz() -> &'static str {
    "ok"
}
