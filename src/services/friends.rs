//! Friend requests and temporary-chat gating.
//!
//! DESIGN
//! ======
//! Friendship is an ACCEPTED request in either direction; there is no
//! separate friendships table, so the request lifecycle and the
//! friendship predicate live in one place. The partial unique index on
//! PENDING rows makes "already pending" an observable outcome rather
//! than an error.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::conversations;
use super::users;

#[derive(Debug, thiserror::Error)]
pub enum FriendError {
    #[error("no pending request to respond to")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Outcome of sending a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// New request created with this id.
    Sent(i64),
    /// A PENDING request for this ordered pair already exists.
    AlreadyPending,
    /// The pair are already friends; nothing was created.
    AlreadyFriends,
}

/// A resolved response to a friend request.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub from_user: Uuid,
    pub to_user: Uuid,
    pub accepted: bool,
}

// =============================================================================
// FRIENDSHIP
// =============================================================================

/// Whether two users are friends (an ACCEPTED request in either direction).
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn are_friends(pool: &PgPool, a: Uuid, b: Uuid) -> Result<bool, FriendError> {
    let friends: bool = sqlx::query_scalar(
        r"SELECT EXISTS(
              SELECT 1 FROM friend_requests
              WHERE status = 'ACCEPTED'
                AND ((from_user = $1 AND to_user = $2) OR (from_user = $2 AND to_user = $1))
          )",
    )
    .bind(a)
    .bind(b)
    .fetch_one(pool)
    .await?;
    Ok(friends)
}

/// Send a friend request from one user to another.
///
/// # Errors
///
/// Returns a database error if any query fails.
pub async fn send_request(pool: &PgPool, from: Uuid, to: Uuid) -> Result<RequestOutcome, FriendError> {
    if are_friends(pool, from, to).await? {
        return Ok(RequestOutcome::AlreadyFriends);
    }

    let row = sqlx::query(
        r"INSERT INTO friend_requests (from_user, to_user)
          VALUES ($1, $2)
          ON CONFLICT (from_user, to_user) WHERE status = 'PENDING' DO NOTHING
          RETURNING id",
    )
    .bind(from)
    .bind(to)
    .fetch_optional(pool)
    .await?;

    Ok(row.map_or(RequestOutcome::AlreadyPending, |r| RequestOutcome::Sent(r.get("id"))))
}

/// Accept or reject a pending request. Only the recipient may respond;
/// acceptance upgrades any TEMP conversation between the pair to FRIEND.
///
/// # Errors
///
/// `NotFound` when no pending request matches, otherwise a database error.
pub async fn respond(
    pool: &PgPool,
    request_id: i64,
    responder: Uuid,
    accept: bool,
) -> Result<ResolvedRequest, FriendError> {
    let status = if accept { "ACCEPTED" } else { "REJECTED" };
    let row = sqlx::query(
        r"UPDATE friend_requests
          SET status = $3, updated_at = now()
          WHERE id = $1 AND to_user = $2 AND status = 'PENDING'
          RETURNING from_user, to_user",
    )
    .bind(request_id)
    .bind(responder)
    .bind(status)
    .fetch_optional(pool)
    .await?
    .ok_or(FriendError::NotFound)?;

    let resolved = ResolvedRequest {
        from_user: row.get("from_user"),
        to_user: row.get("to_user"),
        accepted: accept,
    };

    if accept {
        conversations::upgrade_pair_to_friend(pool, resolved.from_user, resolved.to_user)
            .await
            .map_err(|e| match e {
                conversations::ConversationError::Db(db) => FriendError::Db(db),
                _ => FriendError::NotFound,
            })?;
    }

    Ok(resolved)
}

// =============================================================================
// TEMP-CHAT GATING
// =============================================================================

/// Pure gate: the recipient's global opt-in must be set, and no shared
/// public room may have temporary chats switched off.
#[must_use]
pub fn temp_chat_verdict(recipient_opt_in: bool, shared_room_blocks: bool) -> bool {
    recipient_opt_in && !shared_room_blocks
}

/// Whether a non-friend sender may open a temporary chat with a recipient.
///
/// # Errors
///
/// Returns a database error if any lookup fails.
pub async fn temp_chat_allowed(pool: &PgPool, sender: Uuid, recipient: Uuid) -> Result<bool, FriendError> {
    let opt_in = users::accepts_temp_chats(pool, recipient).await?;
    if !opt_in {
        return Ok(false);
    }
    let blocked = conversations::shared_public_room_blocks_temp(pool, sender, recipient)
        .await
        .map_err(|e| match e {
            conversations::ConversationError::Db(db) => FriendError::Db(db),
            _ => FriendError::NotFound,
        })?;
    Ok(temp_chat_verdict(opt_in, blocked))
}

#[cfg(test)]
#[path = "friends_test.rs"]
mod tests;
