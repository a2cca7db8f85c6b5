//! User accounts — credentials, reconnect tokens, presence flags.
//!
//! DESIGN
//! ======
//! Passwords are stored as `salt$digest` where digest is SHA-256 over the
//! hex salt concatenated with the password. Registration pre-checks the
//! username and still relies on the unique constraint for the insert, so
//! a race between check and insert surfaces as `UsernameTaken` rather
//! than a stray database error.

use std::fmt::Write as _;

use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Minimal account row used by authentication.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
}

// =============================================================================
// HASHING
// =============================================================================

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    bytes_to_hex(&hasher.finalize())
}

/// Produce a fresh `salt$digest` credential hash.
#[must_use]
pub fn hash_password(password: &str) -> String {
    let salt = generate_salt();
    let digest = digest(&salt, password);
    format!("{salt}${digest}")
}

/// Check a password against a stored `salt$digest` hash.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    digest(salt, password) == expected
}

// =============================================================================
// ACCOUNTS
// =============================================================================

/// Create a user.
///
/// # Errors
///
/// `UsernameTaken` when the name exists (pre-check or unique-constraint
/// race), otherwise a database error.
pub async fn create_user(pool: &PgPool, username: &str, password: &str) -> Result<Uuid, UserError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
        .bind(username)
        .fetch_one(pool)
        .await?;
    if exists {
        return Err(UserError::UsernameTaken);
    }

    let row = sqlx::query(
        r"INSERT INTO users (username, password_hash)
          VALUES ($1, $2)
          ON CONFLICT (username) DO NOTHING
          RETURNING id",
    )
    .bind(username)
    .bind(hash_password(password))
    .fetch_optional(pool)
    .await?;

    // A concurrent insert won the race between check and insert.
    row.map(|r| r.get("id")).ok_or(UserError::UsernameTaken)
}

/// Validate a username/password pair. `None` means the pair is wrong;
/// callers must not reveal which half failed.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn verify_credentials(
    pool: &PgPool,
    username: &str,
    password: &str,
) -> Result<Option<UserRecord>, sqlx::Error> {
    let row = sqlx::query("SELECT id, username, password_hash FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|r| {
        let stored: String = r.get("password_hash");
        verify_password(password, &stored)
            .then(|| UserRecord { id: r.get("id"), username: r.get("username") })
    }))
}

/// Look up a username by user id.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn username_of(pool: &PgPool, user_id: Uuid) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

/// Resolve a username to its user id.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn id_of(pool: &PgPool, username: &str) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await
}

// =============================================================================
// TOKENS
// =============================================================================

/// Issue a reusable reconnect token bound to a user.
///
/// # Errors
///
/// Returns a database error if the insert fails.
pub async fn issue_token(pool: &PgPool, user_id: Uuid) -> Result<Uuid, sqlx::Error> {
    let token = Uuid::new_v4();
    sqlx::query("INSERT INTO auth_tokens (token, user_id) VALUES ($1, $2)")
        .bind(token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(token)
}

/// Resolve a reconnect token to its account, if any.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn resolve_token(pool: &PgPool, token: Uuid) -> Result<Option<UserRecord>, sqlx::Error> {
    let row = sqlx::query(
        r"SELECT u.id, u.username
          FROM auth_tokens t
          JOIN users u ON u.id = t.user_id
          WHERE t.token = $1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| UserRecord { id: r.get("id"), username: r.get("username") }))
}

// =============================================================================
// FLAGS
// =============================================================================

/// Record the user's online/offline status.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn set_online(pool: &PgPool, user_id: Uuid, online: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET online = $2 WHERE id = $1")
        .bind(user_id)
        .bind(online)
        .execute(pool)
        .await?;
    Ok(())
}

/// The user's global temporary-chat opt-in.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn accepts_temp_chats(pool: &PgPool, user_id: Uuid) -> Result<bool, sqlx::Error> {
    let flag: Option<bool> = sqlx::query_scalar("SELECT accepts_temp_chats FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(flag.unwrap_or(false))
}

#[cfg(test)]
#[path = "users_test.rs"]
mod tests;
