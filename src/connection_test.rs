use super::*;
use crate::state::test_helpers;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use serde_json::json;

/// In-memory transport: frames in through one channel, frames out through
/// another. Closing the inbound channel hangs up the peer.
struct MockTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
    }

    async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }
}

fn mock_pair() -> (MockTransport, mpsc::Sender<String>, mpsc::UnboundedReceiver<String>) {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (MockTransport { inbound: in_rx, outbound: out_tx }, in_tx, out_rx)
}

fn decoded(out_rx: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
    let text = out_rx.try_recv().expect("expected an outbound frame");
    message::decode(&text).expect("outbound frame decodes")
}

// =============================================================================
// unauthenticated phase
// =============================================================================

#[tokio::test]
async fn non_auth_frames_are_rejected_until_authenticated() {
    let state = test_helpers::test_app_state();
    let (transport, in_tx, mut out_rx) = mock_pair();

    let driver = tokio::spawn(run(state, transport));

    let frame = serde_json::to_string(&Envelope::new(MessageKind::ListRooms, json!(null))).unwrap();
    in_tx.send(frame).await.unwrap();
    drop(in_tx); // hang up

    driver.await.unwrap();
    let reply = decoded(&mut out_rx);
    assert_eq!(reply.kind, MessageKind::AuthFailure);
    assert_eq!(reply.text(), Some("authentication required"));
}

#[tokio::test]
async fn undecodable_frame_is_dropped_silently_and_connection_survives() {
    let state = test_helpers::test_app_state();
    let (transport, in_tx, mut out_rx) = mock_pair();

    let driver = tokio::spawn(run(state, transport));

    in_tx.send("{not json".into()).await.unwrap();
    let frame = serde_json::to_string(&Envelope::new(MessageKind::Join, json!({"room": "x"}))).unwrap();
    in_tx.send(frame).await.unwrap();
    drop(in_tx);

    driver.await.unwrap();
    // No reply for the garbage; the well-formed JOIN still gets refused,
    // which proves the loop survived.
    let reply = decoded(&mut out_rx);
    assert_eq!(reply.kind, MessageKind::AuthFailure);
    assert!(out_rx.try_recv().is_err());
}

#[tokio::test]
async fn blank_lines_are_ignored() {
    let state = test_helpers::test_app_state();
    let (transport, in_tx, mut out_rx) = mock_pair();

    let driver = tokio::spawn(run(state, transport));
    in_tx.send("   ".into()).await.unwrap();
    drop(in_tx);

    driver.await.unwrap();
    assert!(out_rx.try_recv().is_err(), "blank input must produce no reply");
}

#[tokio::test(start_paused = true)]
async fn silent_connection_times_out_with_a_reason() {
    let state = test_helpers::test_app_state();
    let (transport, in_tx, mut out_rx) = mock_pair();

    let driver = tokio::spawn(run(state, transport));
    // No frames arrive; the paused clock auto-advances past the deadline.
    driver.await.unwrap();
    drop(in_tx);

    let reply = decoded(&mut out_rx);
    assert_eq!(reply.kind, MessageKind::AuthFailure);
    assert_eq!(reply.text(), Some("authentication timed out"));
}

#[tokio::test]
async fn failed_auth_keeps_the_connection_open_for_another_try() {
    let state = test_helpers::test_app_state();
    let (transport, in_tx, mut out_rx) = mock_pair();

    let driver = tokio::spawn(run(state, transport));

    // Malformed token fails fast without touching storage.
    let bad = serde_json::to_string(&Envelope::new(
        MessageKind::UuidAuth,
        json!({"token": "not-a-uuid"}),
    ))
    .unwrap();
    in_tx.send(bad.clone()).await.unwrap();
    in_tx.send(bad).await.unwrap();
    drop(in_tx);

    driver.await.unwrap();
    assert_eq!(decoded(&mut out_rx).kind, MessageKind::UuidAuthFailure);
    assert_eq!(decoded(&mut out_rx).kind, MessageKind::UuidAuthFailure);
}
