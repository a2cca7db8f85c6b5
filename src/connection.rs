//! Per-connection lifecycle, shared by both transports.
//!
//! LIFECYCLE
//! =========
//! 1. UNAUTHENTICATED: only REGISTER / LOGIN / UUID_AUTH make progress;
//!    anything else is answered with AUTH_FAILURE. The whole phase runs
//!    under one timeout, after which the connection is dropped.
//! 2. On success the session is registered (single-login enforced at the
//!    registry), the success frame and a one-shot SERVICE_CONFIG frame go
//!    out, and the user is marked online.
//! 3. AUTHENTICATED: a `select!` loop interleaves inbound frames (decode →
//!    dispatch → replies) with outbound frames queued by other sessions.
//! 4. Teardown deregisters the session and marks the user offline, however
//!    the loop ended.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::{self, AuthAttempt};
use crate::dispatch::{self, SessionCtx};
use crate::message::{self, CodecError, Envelope, MessageKind};
use crate::registry::{RegisterOutcome, SessionRegistry};
use crate::services::users;
use crate::state::AppState;
use crate::transport::Transport;

/// How long an unauthenticated connection may live.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one connection from accept to close.
pub async fn run<T: Transport>(state: AppState, mut transport: T) {
    let Some((session, rx, handle)) = authenticate(&state, &mut transport).await else {
        return;
    };

    info!(user_id = %session.user_id, username = %session.username, "session established");
    serve_session(&state, &mut transport, &session, rx).await;

    // Guarded: a reconnect may already own this user id with a new handle.
    state.registry.deregister_session_if_current(session.user_id, &handle).await;
    if let Err(e) = users::set_online(&state.pool, session.user_id, false).await {
        warn!(error = %e, user_id = %session.user_id, "failed to mark user offline");
    }
    info!(user_id = %session.user_id, username = %session.username, "session closed");
}

// =============================================================================
// AUTH PHASE
// =============================================================================

type Established = (SessionCtx, mpsc::Receiver<Envelope>, mpsc::Sender<Envelope>);

async fn authenticate<T: Transport>(state: &AppState, transport: &mut T) -> Option<Established> {
    match tokio::time::timeout(AUTH_TIMEOUT, auth_loop(state, transport)).await {
        Ok(established) => established,
        Err(_) => {
            let _ = send(transport, &Envelope::auth_failure("authentication timed out")).await;
            None
        }
    }
}

async fn auth_loop<T: Transport>(state: &AppState, transport: &mut T) -> Option<Established> {
    loop {
        let text = transport.recv().await?;
        let envelope = match message::decode(&text) {
            Ok(envelope) => envelope,
            Err(CodecError::Empty) => continue,
            // Decode failures are dropped silently; the sender gets no signal.
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };

        if !auth::is_auth_kind(envelope.kind) {
            send(transport, &auth::rejection_for(&envelope)).await.ok()?;
            continue;
        }

        let (user, reply) = match auth::attempt(state, &envelope).await {
            AuthAttempt::Success { user, reply } => (user, reply),
            AuthAttempt::Failure(reply) => {
                send(transport, &reply).await.ok()?;
                continue;
            }
        };

        let (tx, rx) = SessionRegistry::session_channel();
        match state.registry.register_session(user.user_id, &user.username, tx.clone()).await {
            RegisterOutcome::Rejected => {
                // Credentials were fine but another live session won the race.
                send(transport, &Envelope::auth_failure("already logged in elsewhere")).await.ok()?;
                continue;
            }
            RegisterOutcome::Registered | RegisterOutcome::Reconnected => {}
        }

        send(transport, &reply).await.ok()?;
        let config_frame =
            Envelope::new(MessageKind::ServiceConfig, state.config.client_payload()).with_from("server");
        send(transport, &config_frame).await.ok()?;

        if let Err(e) = users::set_online(&state.pool, user.user_id, true).await {
            warn!(error = %e, user_id = %user.user_id, "failed to mark user online");
        }
        return Some((SessionCtx { user_id: user.user_id, username: user.username }, rx, tx));
    }
}

// =============================================================================
// MAIN LOOP
// =============================================================================

async fn serve_session<T: Transport>(
    state: &AppState,
    transport: &mut T,
    session: &SessionCtx,
    mut rx: mpsc::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            inbound = transport.recv() => {
                let Some(text) = inbound else { break };
                let envelope = match message::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(CodecError::Empty) => continue,
                    Err(e) => {
                        warn!(user = %session.username, error = %e, "dropping undecodable frame");
                        continue;
                    }
                };

                let result = dispatch::dispatch(state, session, envelope).await;
                let mut failed = false;
                for reply in &result.replies {
                    if send(transport, reply).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed || result.close {
                    break;
                }
            }
            outbound = rx.recv() => {
                // A closed channel means the registry replaced this session.
                let Some(envelope) = outbound else { break };
                if send(transport, &envelope).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send<T: Transport>(transport: &mut T, envelope: &Envelope) -> Result<(), ()> {
    let text = match message::encode(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "unsendable frame");
            return Ok(());
        }
    };
    transport.send(text).await.map_err(|e| {
        warn!(error = %e, "transport send failed");
    })
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
