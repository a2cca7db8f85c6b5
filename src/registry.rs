//! Session registry — live sessions, room presence, and routing.
//!
//! ARCHITECTURE
//! ============
//! The registry is the single in-memory source of truth for who is
//! connected and which rooms they currently occupy. Durable membership
//! lives in storage (see `services::conversations`); the registry only
//! tracks live presence and owns the outbound channel of every session.
//!
//! DESIGN
//! ======
//! - One `RwLock` guards the combined session/room maps, so a join or
//!   leave mutates both sides atomically — a user is never recorded in a
//!   room the room does not know about, or vice versa.
//! - Delivery uses per-session `mpsc::Sender::try_send` under the read
//!   lock. Sends never block, so a slow client cannot stall routing to
//!   anyone else; a full or closed queue is a best-effort drop.
//! - At most one active session exists per username. A registration for a
//!   username whose session is still live is rejected; one whose channel
//!   has already closed replaces the connection handle in place, keeping
//!   room presence (the reconnect path).

use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::message::Envelope;

/// Name of the reserved room whose broadcasts reach every live session.
pub const SYSTEM_ROOM: &str = "system";

/// Queue depth per session before best-effort drops kick in.
const SESSION_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

/// Room visibility. Behavior differences are a switch on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Private,
}

/// Result of attempting to register a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Fresh session inserted.
    Registered,
    /// Existing session's dead connection handle was replaced; room
    /// presence preserved.
    Reconnected,
    /// A still-active session exists for this username.
    Rejected,
}

/// Result of a point-to-point delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No active session, or its queue was unavailable. The caller has
    /// already persisted the message, so this means "queued, not lost".
    NotDelivered,
}

#[derive(Debug)]
struct SessionEntry {
    username: String,
    active: bool,
    outbound: mpsc::Sender<Envelope>,
    rooms: HashSet<i64>,
}

#[derive(Debug)]
struct RoomPresence {
    name: String,
    kind: RoomKind,
    members: HashSet<Uuid>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<Uuid, SessionEntry>,
    by_username: HashMap<String, Uuid>,
    rooms: HashMap<i64, RoomPresence>,
}

/// Concurrent registry of live sessions and room presence.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

/// Snapshot row for room iteration.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub conversation_id: i64,
    pub name: String,
    pub kind: RoomKind,
    pub member_count: usize,
}

// =============================================================================
// SESSIONS
// =============================================================================

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbound channel a connection drains into its transport.
    #[must_use]
    pub fn session_channel() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(SESSION_QUEUE_CAPACITY)
    }

    /// Register a session for an authenticated user.
    ///
    /// Rejected when a still-active session exists for the same username;
    /// the existing session is never evicted or mutated by the attempt.
    pub async fn register_session(
        &self,
        user_id: Uuid,
        username: &str,
        outbound: mpsc::Sender<Envelope>,
    ) -> RegisterOutcome {
        let mut inner = self.inner.write().await;

        if let Some(existing_id) = inner.by_username.get(username).copied() {
            let Some(entry) = inner.sessions.get_mut(&existing_id) else {
                // Stale index entry; fall through to a fresh insert.
                inner.by_username.remove(username);
                return insert_session(&mut inner, user_id, username, outbound);
            };
            if entry.active && !entry.outbound.is_closed() {
                return RegisterOutcome::Rejected;
            }
            // The previous connection died but cleanup has not run yet:
            // replace the handle in place and keep room presence.
            entry.outbound = outbound;
            entry.active = true;
            debug!(%user_id, username, "registry: session reconnected");
            return RegisterOutcome::Reconnected;
        }

        insert_session(&mut inner, user_id, username, outbound)
    }

    /// Remove a session: marks it inactive, drops it from every room it
    /// occupies, and deletes it from the maps. Idempotent.
    pub async fn deregister_session(&self, user_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(mut entry) = inner.sessions.remove(&user_id) else {
            return;
        };
        entry.active = false;
        inner.by_username.remove(&entry.username);
        // Best-effort per room: a missing room entry does not abort the rest.
        for room_id in &entry.rooms {
            if let Some(room) = inner.rooms.get_mut(room_id) {
                room.members.remove(&user_id);
            }
        }
        debug!(%user_id, username = %entry.username, "registry: session deregistered");
    }

    /// Deregister only if the registered outbound handle is still `handle`.
    /// A connection that was replaced by a reconnect must not tear down the
    /// replacement's session on its own way out.
    pub async fn deregister_session_if_current(&self, user_id: Uuid, handle: &mpsc::Sender<Envelope>) {
        {
            let inner = self.inner.read().await;
            let still_current = inner
                .sessions
                .get(&user_id)
                .is_some_and(|s| s.outbound.same_channel(handle));
            if !still_current {
                return;
            }
        }
        self.deregister_session(user_id).await;
    }

    /// Whether a username currently has an active session.
    pub async fn is_online(&self, username: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_username
            .get(username)
            .and_then(|id| inner.sessions.get(id))
            .is_some_and(|s| s.active && !s.outbound.is_closed())
    }

    /// Resolve a username to its live session's user id.
    pub async fn user_id_for(&self, username: &str) -> Option<Uuid> {
        self.inner.read().await.by_username.get(username).copied()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Room ids the user currently occupies.
    pub async fn rooms_of(&self, user_id: Uuid) -> Vec<i64> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(&user_id)
            .map(|s| s.rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn insert_session(
    inner: &mut Inner,
    user_id: Uuid,
    username: &str,
    outbound: mpsc::Sender<Envelope>,
) -> RegisterOutcome {
    inner.sessions.insert(
        user_id,
        SessionEntry {
            username: username.to_owned(),
            active: true,
            outbound,
            rooms: HashSet::new(),
        },
    );
    inner.by_username.insert(username.to_owned(), user_id);
    debug!(%user_id, username, "registry: session registered");
    RegisterOutcome::Registered
}

// =============================================================================
// ROOMS
// =============================================================================

impl SessionRegistry {
    /// Ensure a presence entry exists for a room. Returns false when the id
    /// was already present (creation is the storage layer's job; ids come
    /// from there).
    pub async fn create_room(&self, conversation_id: i64, name: &str, kind: RoomKind) -> bool {
        let mut inner = self.inner.write().await;
        if inner.rooms.contains_key(&conversation_id) {
            return false;
        }
        inner.rooms.insert(
            conversation_id,
            RoomPresence { name: name.to_owned(), kind, members: HashSet::new() },
        );
        true
    }

    /// Record live presence of a user in a room. Both the room's member
    /// set and the user's room list are updated under one lock.
    pub async fn join_room(&self, user_id: Uuid, conversation_id: i64) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&user_id) || !inner.rooms.contains_key(&conversation_id) {
            return false;
        }
        if let Some(session) = inner.sessions.get_mut(&user_id) {
            session.rooms.insert(conversation_id);
        }
        if let Some(room) = inner.rooms.get_mut(&conversation_id) {
            room.members.insert(user_id);
        }
        true
    }

    /// Drop live presence of a user from a room. Idempotent.
    pub async fn leave_room(&self, user_id: Uuid, conversation_id: i64) -> bool {
        let mut inner = self.inner.write().await;
        let mut removed = false;
        if let Some(session) = inner.sessions.get_mut(&user_id) {
            removed = session.rooms.remove(&conversation_id);
        }
        if let Some(room) = inner.rooms.get_mut(&conversation_id) {
            removed |= room.members.remove(&user_id);
        }
        removed
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Snapshot of rooms for iteration; safe against concurrent mutation.
    pub async fn rooms_snapshot(&self) -> Vec<RoomSnapshot> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .iter()
            .map(|(id, room)| RoomSnapshot {
                conversation_id: *id,
                name: room.name.clone(),
                kind: room.kind,
                member_count: room.members.len(),
            })
            .collect()
    }

    /// Usernames with live presence in a room.
    pub async fn room_member_names(&self, conversation_id: i64) -> Vec<String> {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(&conversation_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|id| inner.sessions.get(id).map(|s| s.username.clone()))
            .collect()
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl SessionRegistry {
    /// Deliver one envelope to one user's live session.
    pub async fn send_to_user(&self, user_id: Uuid, envelope: &Envelope) -> Delivery {
        let inner = self.inner.read().await;
        let Some(session) = inner.sessions.get(&user_id) else {
            return Delivery::NotDelivered;
        };
        if !session.active {
            return Delivery::NotDelivered;
        }
        match session.outbound.try_send(envelope.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::NotDelivered,
        }
    }

    /// Deliver one envelope by username.
    pub async fn send_to_username(&self, username: &str, envelope: &Envelope) -> Delivery {
        let target = {
            let inner = self.inner.read().await;
            inner.by_username.get(username).copied()
        };
        match target {
            Some(user_id) => self.send_to_user(user_id, envelope).await,
            None => Delivery::NotDelivered,
        }
    }

    /// Fan one envelope out to a room's live members.
    ///
    /// The reserved `"system"` room targets every active session instead
    /// of its nominal member set. Each member's send is attempted
    /// independently; one failure never aborts the loop.
    pub async fn broadcast_to_room(
        &self,
        conversation_id: i64,
        envelope: &Envelope,
        exclude: Option<Uuid>,
    ) -> bool {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(&conversation_id) else {
            return false;
        };

        if room.name == SYSTEM_ROOM {
            for (user_id, session) in &inner.sessions {
                if exclude == Some(*user_id) {
                    continue;
                }
                let _ = session.outbound.try_send(envelope.clone());
            }
            return true;
        }

        for user_id in &room.members {
            if exclude == Some(*user_id) {
                continue;
            }
            if let Some(session) = inner.sessions.get(user_id) {
                let _ = session.outbound.try_send(envelope.clone());
            }
        }
        true
    }

    /// Fan one envelope out to every active session.
    pub async fn broadcast_all(&self, envelope: &Envelope) {
        let inner = self.inner.read().await;
        for session in inner.sessions.values() {
            let _ = session.outbound.try_send(envelope.clone());
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
