mod auth;
mod config;
mod connection;
mod db;
mod dispatch;
mod message;
mod registry;
mod services;
mod state;
mod transport;

use registry::{RoomKind, SYSTEM_ROOM};
use services::conversations;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let config = config::ServiceConfig::from_env();

    let pool = db::init_pool(&database_url).await.expect("database init failed");
    let state = state::AppState::new(pool, config);

    seed_system_room(&state).await;

    // TCP transport on its own task; the WS/HTTP server owns this one.
    let tcp_state = state.clone();
    let tcp_port = state.config.tcp_port;
    tokio::spawn(async move {
        if let Err(e) = transport::tcp::serve(tcp_state, tcp_port).await {
            tracing::error!(error = %e, "tcp transport failed");
        }
    });

    let ws_port = state.config.ws_port;
    let app = transport::ws::router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{ws_port}"))
        .await
        .expect("failed to bind ws port");

    tracing::info!(%ws_port, "parley listening");
    axum::serve(listener, app).await.expect("server failed");
}

/// The system room's presence entry must exist before any session joins,
/// since system-room broadcasts reach every connected session.
async fn seed_system_room(state: &state::AppState) {
    match conversations::find_room(&state.pool, SYSTEM_ROOM).await {
        Ok(Some(room)) => {
            state.registry.create_room(room.conversation_id, SYSTEM_ROOM, RoomKind::Public).await;
        }
        Ok(None) => tracing::warn!("system room missing from storage"),
        Err(e) => tracing::warn!(error = %e, "system room lookup failed"),
    }
}
