//! Conversation and room model.
//!
//! ARCHITECTURE
//! ============
//! A conversation is the unified delivery target: ROOM (backed by a room
//! record), FRIEND (permanent two-party), or TEMP (two-party between
//! non-friends). Legacy room records may predate the conversation model;
//! lookups migrate them in place so both membership stores stay
//! reconciled.
//!
//! DESIGN
//! ======
//! - A room and its ROOM conversation are created in one transaction;
//!   neither exists without the other from this module's point of view.
//! - For any two users there is at most one non-ROOM conversation; once
//!   the pair become friends an existing TEMP conversation upgrades to
//!   FRIEND in place, keeping its id and history.
//! - Room roles: exactly one OWNER, assigned at creation and never
//!   demotable through the admin path.

use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("room name already exists")]
    NameTaken,
    #[error("conversation not found")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Room,
    Friend,
    Temp,
}

impl ConversationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Room => "ROOM",
            Self::Friend => "FRIEND",
            Self::Temp => "TEMP",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ROOM" => Some(Self::Room),
            "FRIEND" => Some(Self::Friend),
            "TEMP" => Some(Self::Temp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OWNER" => Some(Self::Owner),
            "ADMIN" => Some(Self::Admin),
            "MEMBER" => Some(Self::Member),
            _ => None,
        }
    }

    /// Whether this role may run admin-gated room operations.
    #[must_use]
    pub fn can_administrate(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub kind: ConversationKind,
    pub name: String,
}

/// A room with its backing conversation resolved.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: i64,
    pub conversation_id: i64,
    pub name: String,
    pub is_public: bool,
    pub owner_id: Option<Uuid>,
    pub allow_temp_chats: bool,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

/// Canonical display name for a two-party conversation, order-independent.
#[must_use]
pub fn pair_name(a: &str, b: &str) -> String {
    if a <= b { format!("{a}:{b}") } else { format!("{b}:{a}") }
}

// =============================================================================
// ROOMS
// =============================================================================

/// Find a room by name, migrating a legacy room-only record into the
/// conversation model if needed.
///
/// # Errors
///
/// Returns a database error if lookup or migration fails.
pub async fn find_room(pool: &PgPool, name: &str) -> Result<Option<RoomRecord>, ConversationError> {
    let row = sqlx::query(
        r"SELECT r.id AS room_id, r.conversation_id, r.name, r.is_public, r.owner_id, r.allow_temp_chats
          FROM conversations c
          JOIN rooms r ON r.conversation_id = c.id
          WHERE c.kind = 'ROOM' AND c.name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    if let Some(r) = row {
        return Ok(Some(room_from_row(&r)?));
    }

    // Fall back to a legacy room record that has no conversation yet.
    let legacy = sqlx::query(
        "SELECT id, name, is_public, owner_id, allow_temp_chats FROM rooms WHERE name = $1 AND conversation_id IS NULL",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    let Some(legacy) = legacy else {
        return Ok(None);
    };
    let record = migrate_legacy_room(pool, &legacy).await?;
    Ok(Some(record))
}

/// Backfill a conversation for a legacy room and copy its membership.
async fn migrate_legacy_room(
    pool: &PgPool,
    legacy: &sqlx::postgres::PgRow,
) -> Result<RoomRecord, ConversationError> {
    let room_id: i64 = legacy.get("id");
    let name: String = legacy.get("name");

    let mut tx = pool.begin().await?;
    let conversation_id: i64 =
        sqlx::query_scalar("INSERT INTO conversations (kind, name) VALUES ('ROOM', $1) RETURNING id")
            .bind(&name)
            .fetch_one(&mut *tx)
            .await?;
    sqlx::query("UPDATE rooms SET conversation_id = $2 WHERE id = $1")
        .bind(room_id)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r"INSERT INTO conversation_members (conversation_id, user_id, role)
          SELECT $1, rm.user_id, CASE WHEN rm.user_id = r.owner_id THEN 'OWNER' ELSE 'MEMBER' END
          FROM room_members rm
          JOIN rooms r ON r.id = rm.room_id
          WHERE rm.room_id = $2
          ON CONFLICT (conversation_id, user_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(room_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(room = %name, %conversation_id, "migrated legacy room into conversation model");
    Ok(RoomRecord {
        room_id,
        conversation_id,
        name,
        is_public: legacy.get("is_public"),
        owner_id: legacy.get("owner_id"),
        allow_temp_chats: legacy.get("allow_temp_chats"),
    })
}

/// Create a room and its backing conversation in one transaction; the
/// creator becomes OWNER and an initial member of both stores.
///
/// # Errors
///
/// `NameTaken` when the name exists, otherwise a database error.
pub async fn create_room(
    pool: &PgPool,
    name: &str,
    is_public: bool,
    owner_id: Uuid,
) -> Result<RoomRecord, ConversationError> {
    let mut tx = pool.begin().await?;

    let conversation_id = match sqlx::query_scalar::<_, i64>(
        "INSERT INTO conversations (kind, name) VALUES ('ROOM', $1) RETURNING id",
    )
    .bind(name)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => return Err(ConversationError::NameTaken),
        Err(e) => return Err(e.into()),
    };

    let room_id = match sqlx::query_scalar::<_, i64>(
        r"INSERT INTO rooms (name, is_public, owner_id, conversation_id)
          VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(name)
    .bind(is_public)
    .bind(owner_id)
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => return Err(ConversationError::NameTaken),
        Err(e) => return Err(e.into()),
    };

    insert_membership(&mut tx, conversation_id, room_id, owner_id, Role::Owner).await?;
    tx.commit().await?;

    Ok(RoomRecord {
        room_id,
        conversation_id,
        name: name.to_owned(),
        is_public,
        owner_id: Some(owner_id),
        allow_temp_chats: true,
    })
}

/// Record durable membership in both stores, exactly once each.
///
/// # Errors
///
/// Returns a database error if either insert fails.
pub async fn join_room(pool: &PgPool, room: &RoomRecord, user_id: Uuid) -> Result<(), ConversationError> {
    let mut tx = pool.begin().await?;
    insert_membership(&mut tx, room.conversation_id, room.room_id, user_id, Role::Member).await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_membership(
    tx: &mut Transaction<'_, Postgres>,
    conversation_id: i64,
    room_id: i64,
    user_id: Uuid,
    role: Role,
) -> Result<(), sqlx::Error> {
    // ON CONFLICT keeps re-joins from duplicating membership rows.
    sqlx::query(
        r"INSERT INTO conversation_members (conversation_id, user_id, role)
          VALUES ($1, $2, $3)
          ON CONFLICT (conversation_id, user_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(role.as_str())
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "INSERT INTO room_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT (room_id, user_id) DO NOTHING",
    )
    .bind(room_id)
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete durable membership from both stores.
///
/// # Errors
///
/// Returns a database error if either delete fails.
pub async fn exit_room(pool: &PgPool, room: &RoomRecord, user_id: Uuid) -> Result<(), ConversationError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2")
        .bind(room.conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
        .bind(room.room_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Public rooms, for LIST_ROOMS.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_public_rooms(pool: &PgPool) -> Result<Vec<RoomRecord>, ConversationError> {
    let rows = sqlx::query(
        r"SELECT r.id AS room_id, r.conversation_id, r.name, r.is_public, r.owner_id, r.allow_temp_chats
          FROM rooms r
          WHERE r.is_public AND r.conversation_id IS NOT NULL
          ORDER BY r.name",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(room_from_row).collect()
}

fn room_from_row(row: &sqlx::postgres::PgRow) -> Result<RoomRecord, ConversationError> {
    let conversation_id: Option<i64> = row.get("conversation_id");
    Ok(RoomRecord {
        room_id: row.get("room_id"),
        conversation_id: conversation_id.ok_or(ConversationError::NotFound)?,
        name: row.get("name"),
        is_public: row.get("is_public"),
        owner_id: row.get("owner_id"),
        allow_temp_chats: row.get("allow_temp_chats"),
    })
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

/// Load a conversation by id.
///
/// # Errors
///
/// Returns a database error if the lookup fails.
pub async fn get(pool: &PgPool, conversation_id: i64) -> Result<Option<Conversation>, ConversationError> {
    let row = sqlx::query("SELECT id, kind, name FROM conversations WHERE id = $1")
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else { return Ok(None) };
    let kind: String = row.get("kind");
    Ok(Some(Conversation {
        id: row.get("id"),
        kind: ConversationKind::parse(&kind).ok_or(ConversationError::NotFound)?,
        name: row.get("name"),
    }))
}

/// Members of a conversation with usernames resolved.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn members(pool: &PgPool, conversation_id: i64) -> Result<Vec<Member>, ConversationError> {
    let rows = sqlx::query(
        r"SELECT m.user_id, u.username, m.role
          FROM conversation_members m
          JOIN users u ON u.id = m.user_id
          WHERE m.conversation_id = $1
          ORDER BY u.username",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let role: String = r.get("role");
            Some(Member {
                user_id: r.get("user_id"),
                username: r.get("username"),
                role: Role::parse(&role)?,
            })
        })
        .collect())
}

/// Whether a user belongs to a conversation.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn is_member(pool: &PgPool, conversation_id: i64, user_id: Uuid) -> Result<bool, ConversationError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2)",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// The caller's role in a conversation.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn role_of(pool: &PgPool, conversation_id: i64, user_id: Uuid) -> Result<Option<Role>, ConversationError> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT role FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(role.as_deref().and_then(Role::parse))
}

/// Grant or revoke ADMIN on a member. The OWNER row is never touched.
///
/// # Errors
///
/// `NotFound` when the target is not a non-owner member, otherwise a
/// database error.
pub async fn set_admin(
    pool: &PgPool,
    conversation_id: i64,
    target: Uuid,
    grant: bool,
) -> Result<(), ConversationError> {
    let role = if grant { Role::Admin } else { Role::Member };
    let result = sqlx::query(
        r"UPDATE conversation_members SET role = $3
          WHERE conversation_id = $1 AND user_id = $2 AND role <> 'OWNER'",
    )
    .bind(conversation_id)
    .bind(target)
    .bind(role.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ConversationError::NotFound);
    }
    Ok(())
}

/// Apply partial settings to a room; absent fields keep their value.
///
/// # Errors
///
/// `NotFound` when the room row is gone, otherwise a database error.
pub async fn update_room_settings(
    pool: &PgPool,
    room_id: i64,
    allow_temp_chats: Option<bool>,
    is_public: Option<bool>,
) -> Result<(), ConversationError> {
    let result = sqlx::query(
        r"UPDATE rooms
          SET allow_temp_chats = COALESCE($2, allow_temp_chats),
              is_public = COALESCE($3, is_public)
          WHERE id = $1",
    )
    .bind(room_id)
    .bind(allow_temp_chats)
    .bind(is_public)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ConversationError::NotFound);
    }
    Ok(())
}

// =============================================================================
// PRIVATE CONVERSATIONS
// =============================================================================

/// Find or create the single two-party conversation between two users.
///
/// An existing TEMP conversation upgrades to FRIEND in place when the
/// pair have since become friends; id and history are untouched.
///
/// # Errors
///
/// Returns a database error if lookup, upgrade, or creation fails.
pub async fn get_or_create_private(
    pool: &PgPool,
    a: (Uuid, &str),
    b: (Uuid, &str),
    are_friends: bool,
) -> Result<Conversation, ConversationError> {
    if let Some(existing) = find_private(pool, a.0, b.0).await? {
        if existing.kind == ConversationKind::Temp && are_friends {
            sqlx::query("UPDATE conversations SET kind = 'FRIEND' WHERE id = $1")
                .bind(existing.id)
                .execute(pool)
                .await?;
            info!(conversation_id = existing.id, "upgraded TEMP conversation to FRIEND");
            return Ok(Conversation { kind: ConversationKind::Friend, ..existing });
        }
        return Ok(existing);
    }

    let kind = if are_friends { ConversationKind::Friend } else { ConversationKind::Temp };
    let name = pair_name(a.1, b.1);

    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query_scalar("INSERT INTO conversations (kind, name) VALUES ($1, $2) RETURNING id")
        .bind(kind.as_str())
        .bind(&name)
        .fetch_one(&mut *tx)
        .await?;
    for user_id in [a.0, b.0] {
        sqlx::query("INSERT INTO conversation_members (conversation_id, user_id, role) VALUES ($1, $2, 'MEMBER')")
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Conversation { id, kind, name })
}

/// Locate the existing two-party conversation for a pair, either order.
async fn find_private(pool: &PgPool, a: Uuid, b: Uuid) -> Result<Option<Conversation>, ConversationError> {
    let row = sqlx::query(
        r"SELECT c.id, c.kind, c.name
          FROM conversations c
          WHERE c.kind IN ('FRIEND', 'TEMP')
            AND EXISTS (SELECT 1 FROM conversation_members m
                        WHERE m.conversation_id = c.id AND m.user_id = $1)
            AND EXISTS (SELECT 1 FROM conversation_members m
                        WHERE m.conversation_id = c.id AND m.user_id = $2)
          LIMIT 1",
    )
    .bind(a)
    .bind(b)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let kind: String = row.get("kind");
    Ok(Some(Conversation {
        id: row.get("id"),
        kind: ConversationKind::parse(&kind).ok_or(ConversationError::NotFound)?,
        name: row.get("name"),
    }))
}

/// Upgrade any TEMP conversation between a pair to FRIEND. Used when a
/// friend request is accepted.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn upgrade_pair_to_friend(pool: &PgPool, a: Uuid, b: Uuid) -> Result<(), ConversationError> {
    sqlx::query(
        r"UPDATE conversations SET kind = 'FRIEND'
          WHERE kind = 'TEMP'
            AND EXISTS (SELECT 1 FROM conversation_members m
                        WHERE m.conversation_id = conversations.id AND m.user_id = $1)
            AND EXISTS (SELECT 1 FROM conversation_members m
                        WHERE m.conversation_id = conversations.id AND m.user_id = $2)",
    )
    .bind(a)
    .bind(b)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether two users currently share at least one public room that has
/// temporary chats disabled. Used by the temp-chat gate.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn shared_public_room_blocks_temp(
    pool: &PgPool,
    a: Uuid,
    b: Uuid,
) -> Result<bool, ConversationError> {
    let blocked: bool = sqlx::query_scalar(
        r"SELECT EXISTS(
              SELECT 1 FROM rooms r
              WHERE r.is_public
                AND NOT r.allow_temp_chats
                AND EXISTS (SELECT 1 FROM room_members m WHERE m.room_id = r.id AND m.user_id = $1)
                AND EXISTS (SELECT 1 FROM room_members m WHERE m.room_id = r.id AND m.user_id = $2)
          )",
    )
    .bind(a)
    .bind(b)
    .fetch_one(pool)
    .await?;
    Ok(blocked)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
#[path = "conversations_test.rs"]
mod tests;
