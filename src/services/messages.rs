//! Message persistence — save, history, latest timestamp, recall.
//!
//! DESIGN
//! ======
//! Messages are immutable once stored; recall flips a flag instead of
//! deleting the row, bounded by a two-minute window from the message's
//! own timestamp. The verdict (ownership first, then expiry) is a pure
//! function so both denial reasons stay distinct and testable.

use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Recall is allowed up to and including this many milliseconds after a
/// message's timestamp.
pub const RECALL_WINDOW_MS: i64 = 120_000;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message not found")]
    NotFound,
    #[error("only the original sender may recall a message")]
    NotOwner,
    #[error("recall window expired")]
    RecallExpired,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// A stored message as returned to history queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub from: String,
    pub kind: String,
    pub content: Value,
    pub is_nsfw: bool,
    pub iv: Option<String>,
    pub time: i64,
    pub recalled: bool,
}

/// How much history to fetch.
#[derive(Debug, Clone, Copy)]
pub enum HistoryQuery {
    /// Messages strictly newer than the given timestamp (ms).
    Since(i64),
    /// The most recent N messages, oldest first.
    LastN(i64),
}

impl HistoryQuery {
    /// Select the mode from optional request fields: a valid positive
    /// `since` wins, otherwise last-N with a clamped limit.
    #[must_use]
    pub fn from_request(since: Option<i64>, limit: Option<i64>) -> Self {
        match since {
            Some(ts) if ts > 0 => Self::Since(ts),
            _ => Self::LastN(limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)),
        }
    }
}

// =============================================================================
// SAVE / FETCH
// =============================================================================

/// Persist one message; returns its id.
///
/// # Errors
///
/// Returns a database error if the insert fails.
#[allow(clippy::too_many_arguments)]
pub async fn save_message(
    pool: &PgPool,
    conversation_id: i64,
    sender_id: Uuid,
    kind: &str,
    content: &Value,
    is_nsfw: bool,
    iv: Option<&str>,
    sent_at: i64,
) -> Result<i64, MessageError> {
    let id: i64 = sqlx::query_scalar(
        r"INSERT INTO messages (conversation_id, sender_id, kind, content, is_nsfw, iv, sent_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7)
          RETURNING id",
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(kind)
    .bind(content)
    .bind(is_nsfw)
    .bind(iv)
    .bind(sent_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Fetch history for a conversation, oldest first. Recalled messages are
/// returned with their flag set so clients can render a placeholder.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn fetch_history(
    pool: &PgPool,
    conversation_id: i64,
    query: HistoryQuery,
) -> Result<Vec<StoredMessage>, MessageError> {
    let rows = match query {
        HistoryQuery::Since(ts) => {
            sqlx::query(
                r"SELECT m.id, m.conversation_id, u.username, m.kind, m.content, m.is_nsfw, m.iv, m.sent_at, m.recalled
                  FROM messages m JOIN users u ON u.id = m.sender_id
                  WHERE m.conversation_id = $1 AND m.sent_at > $2
                  ORDER BY m.sent_at ASC, m.id ASC",
            )
            .bind(conversation_id)
            .bind(ts)
            .fetch_all(pool)
            .await?
        }
        HistoryQuery::LastN(limit) => {
            sqlx::query(
                r"SELECT id, conversation_id, username, kind, content, is_nsfw, iv, sent_at, recalled
                  FROM (
                      SELECT m.id, m.conversation_id, u.username, m.kind, m.content, m.is_nsfw, m.iv, m.sent_at, m.recalled
                      FROM messages m JOIN users u ON u.id = m.sender_id
                      WHERE m.conversation_id = $1
                      ORDER BY m.sent_at DESC, m.id DESC
                      LIMIT $2
                  ) recent
                  ORDER BY sent_at ASC, id ASC",
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .into_iter()
        .map(|r| StoredMessage {
            id: r.get("id"),
            conversation_id: r.get("conversation_id"),
            from: r.get("username"),
            kind: r.get("kind"),
            content: r.get("content"),
            is_nsfw: r.get("is_nsfw"),
            iv: r.get("iv"),
            time: r.get("sent_at"),
            recalled: r.get("recalled"),
        })
        .collect())
}

/// Timestamp of the newest message in a conversation, if any.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn latest_timestamp(pool: &PgPool, conversation_id: i64) -> Result<Option<i64>, MessageError> {
    let ts: Option<i64> =
        sqlx::query_scalar("SELECT MAX(sent_at) FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(pool)
            .await?;
    Ok(ts)
}

// =============================================================================
// RECALL
// =============================================================================

/// Pure recall decision. Ownership is checked before expiry so the two
/// denial reasons are always reported distinctly.
///
/// # Errors
///
/// `NotOwner` when the requester did not send the message, `RecallExpired`
/// when more than [`RECALL_WINDOW_MS`] has elapsed (the boundary itself is
/// accepted).
pub fn recall_verdict(requester: Uuid, sender: Uuid, sent_at: i64, now: i64) -> Result<(), MessageError> {
    if requester != sender {
        return Err(MessageError::NotOwner);
    }
    if now.saturating_sub(sent_at) > RECALL_WINDOW_MS {
        return Err(MessageError::RecallExpired);
    }
    Ok(())
}

/// Recall a message. Returns its conversation id so the caller can notify
/// the conversation's members.
///
/// # Errors
///
/// `NotFound`, `NotOwner`, or `RecallExpired` per the checks; otherwise a
/// database error.
pub async fn recall_message(
    pool: &PgPool,
    message_id: i64,
    requester: Uuid,
    now: i64,
) -> Result<i64, MessageError> {
    let row = sqlx::query("SELECT sender_id, sent_at, conversation_id FROM messages WHERE id = $1")
        .bind(message_id)
        .fetch_optional(pool)
        .await?
        .ok_or(MessageError::NotFound)?;

    let sender: Uuid = row.get("sender_id");
    let sent_at: i64 = row.get("sent_at");
    recall_verdict(requester, sender, sent_at, now)?;

    sqlx::query("UPDATE messages SET recalled = TRUE WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(row.get("conversation_id"))
}

#[cfg(test)]
#[path = "messages_test.rs"]
mod tests;
