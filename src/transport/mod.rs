//! Transport abstraction.
//!
//! ARCHITECTURE
//! ============
//! Both wire surfaces — line-delimited TCP and WebSocket — speak the same
//! protocol: one JSON envelope per text frame. Everything above the frame
//! boundary (auth, dispatch, routing) lives in `connection::run`, which is
//! generic over this trait, so a transport only has to turn its medium
//! into text frames and back.

use async_trait::async_trait;

pub mod tcp;
pub mod ws;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    Ws(#[from] axum::Error),
}

/// One bidirectional stream of text frames.
#[async_trait]
pub trait Transport: Send {
    /// Send one complete text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next complete text frame. `None` means the peer is gone
    /// and the connection loop should wind down.
    async fn recv(&mut self) -> Option<String>;
}
