//! Authentication state machine.
//!
//! DESIGN
//! ======
//! A connection is UNAUTHENTICATED until exactly one of REGISTER, LOGIN,
//! or UUID_AUTH succeeds; the transition is terminal for the connection's
//! lifetime. LOGIN failures are deliberately generic ("invalid username
//! or password") so account existence never leaks, while the
//! duplicate-session rejection is a distinct, specific reason. The
//! duplicate check runs before the new session is registered, so a
//! still-active duplicate never exists.

use tracing::{error, info};

use crate::message::{CredentialsPayload, Envelope, MessageKind, TokenPayload};
use crate::services::users;
use crate::state::AppState;

/// Identity established by a successful transition.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: uuid::Uuid,
    pub username: String,
}

/// Result of processing one frame while unauthenticated.
#[derive(Debug)]
pub enum AuthAttempt {
    /// Transition to AUTHENTICATED; `reply` is the success frame to send.
    Success { user: AuthedUser, reply: Envelope },
    /// The frame was an auth message but the transition failed.
    Failure(Envelope),
}

/// Whether a message kind participates in authentication.
#[must_use]
pub fn is_auth_kind(kind: MessageKind) -> bool {
    matches!(kind, MessageKind::Register | MessageKind::Login | MessageKind::UuidAuth)
}

/// Process one auth frame. Any other kind must be answered with a plain
/// auth failure by the caller (see `rejection_for`).
pub async fn attempt(state: &AppState, envelope: &Envelope) -> AuthAttempt {
    match envelope.kind {
        MessageKind::Register => register(state, envelope).await,
        MessageKind::Login => login(state, envelope).await,
        MessageKind::UuidAuth => uuid_auth(state, envelope).await,
        _ => AuthAttempt::Failure(Envelope::auth_failure("authentication required")),
    }
}

/// Response for a non-auth frame received while unauthenticated.
#[must_use]
pub fn rejection_for(envelope: &Envelope) -> Envelope {
    let _ = envelope;
    Envelope::auth_failure("authentication required")
}

// =============================================================================
// TRANSITIONS
// =============================================================================

async fn register(state: &AppState, envelope: &Envelope) -> AuthAttempt {
    let payload: CredentialsPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return AuthAttempt::Failure(Envelope::auth_failure(format!("bad register payload: {e}"))),
    };
    if payload.username.trim().is_empty() || payload.password.is_empty() {
        return AuthAttempt::Failure(Envelope::auth_failure("username and password are required"));
    }

    let user_id = match users::create_user(&state.pool, &payload.username, &payload.password).await {
        Ok(id) => id,
        Err(users::UserError::UsernameTaken) => {
            return AuthAttempt::Failure(Envelope::auth_failure("username already exists"));
        }
        Err(users::UserError::Db(e)) => {
            error!(error = %e, "register: storage failure");
            return AuthAttempt::Failure(Envelope::auth_failure("internal error"));
        }
    };

    let token = match users::issue_token(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "register: token issue failed");
            return AuthAttempt::Failure(Envelope::auth_failure("internal error"));
        }
    };

    info!(%user_id, username = %payload.username, "registered new user");
    let reply = Envelope::new(
        MessageKind::AuthSuccess,
        serde_json::json!({ "username": payload.username, "token": token }),
    )
    .with_from("server");
    AuthAttempt::Success {
        user: AuthedUser { user_id, username: payload.username },
        reply,
    }
}

async fn login(state: &AppState, envelope: &Envelope) -> AuthAttempt {
    let payload: CredentialsPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return AuthAttempt::Failure(Envelope::auth_failure(format!("bad login payload: {e}"))),
    };

    let record = match users::verify_credentials(&state.pool, &payload.username, &payload.password).await {
        Ok(Some(record)) => record,
        // Never reveal which half of the pair was wrong.
        Ok(None) => return AuthAttempt::Failure(Envelope::auth_failure("invalid username or password")),
        Err(e) => {
            error!(error = %e, "login: storage failure");
            return AuthAttempt::Failure(Envelope::auth_failure("internal error"));
        }
    };

    if state.registry.is_online(&record.username).await {
        return AuthAttempt::Failure(Envelope::auth_failure("already logged in elsewhere"));
    }

    // Each login hands out a fresh reconnect token; old ones stay valid.
    let token = match users::issue_token(&state.pool, record.id).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "login: token issue failed");
            return AuthAttempt::Failure(Envelope::auth_failure("internal error"));
        }
    };

    let reply = Envelope::new(
        MessageKind::AuthSuccess,
        serde_json::json!({ "username": record.username, "token": token }),
    )
    .with_from("server");
    AuthAttempt::Success {
        user: AuthedUser { user_id: record.id, username: record.username },
        reply,
    }
}

async fn uuid_auth(state: &AppState, envelope: &Envelope) -> AuthAttempt {
    let payload: TokenPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => {
            return AuthAttempt::Failure(Envelope::uuid_auth_failure(format!("bad auth payload: {e}")));
        }
    };
    let Ok(token) = payload.token.parse::<uuid::Uuid>() else {
        return AuthAttempt::Failure(Envelope::uuid_auth_failure("malformed token"));
    };

    let record = match users::resolve_token(&state.pool, token).await {
        Ok(Some(record)) => record,
        Ok(None) => return AuthAttempt::Failure(Envelope::uuid_auth_failure("unknown token")),
        Err(e) => {
            error!(error = %e, "uuid auth: storage failure");
            return AuthAttempt::Failure(Envelope::uuid_auth_failure("internal error"));
        }
    };

    if state.registry.is_online(&record.username).await {
        return AuthAttempt::Failure(Envelope::uuid_auth_failure("already logged in elsewhere"));
    }

    let reply = Envelope::new(
        MessageKind::UuidAuthSuccess,
        serde_json::json!({ "username": record.username }),
    )
    .with_from("server");
    AuthAttempt::Success {
        user: AuthedUser { user_id: record.id, username: record.username },
        reply,
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
