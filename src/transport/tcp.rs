//! Line-delimited TCP transport.
//!
//! One JSON envelope per `\n`-terminated line. The accept loop spawns a
//! task per connection; everything past framing is `connection::run`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{info, warn};

use crate::connection;
use crate::state::AppState;
use crate::transport::{Transport, TransportError};

pub struct TcpTransport {
    // Lines::next_line is cancellation safe, which the select! in the
    // connection loop relies on.
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TcpTransport {
    #[must_use]
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self { lines: BufReader::new(read).lines(), writer: write }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        match self.lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "tcp: read failed");
                None
            }
        }
    }
}

/// Accept loop. Runs until the listener itself fails.
///
/// # Errors
///
/// Returns the bind or accept error; per-connection failures are contained
/// in their own tasks.
pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tcp transport listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            info!(%peer, "tcp: connection accepted");
            connection::run(state, TcpTransport::new(stream)).await;
            info!(%peer, "tcp: connection closed");
        });
    }
}
