//! Protocol dispatcher — one entry point per decoded frame.
//!
//! ARCHITECTURE
//! ============
//! The connection loop hands every decoded envelope of an authenticated
//! session to [`dispatch`]. Handlers validate the payload, consult the
//! storage services, route through the registry, and return the frames
//! owed to the sender; broadcasts to other sessions happen inside the
//! handler via the registry. Nothing here is fatal: storage errors are
//! logged and surfaced as a generic internal-error SYSTEM frame, and the
//! connection stays open.
//!
//! ERROR HANDLING
//! ==============
//! - Malformed payloads → SYSTEM frame naming the defect.
//! - Authorization failures → specific denial reason (never generic), so
//!   clients can distinguish "not a member" from "not the owner".
//! - Storage failures → logged, generic "internal error" to the client.

use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::message::{
    ChatPayload, CreateRoomPayload, Envelope, FriendRequestPayload, FriendResponsePayload,
    HistoryPayload, ConversationPayload, MessageKind, PrivateChatPayload, RecallPayload,
    RoomAdminPayload, RoomPayload, RoomSettingsPayload, now_ms,
};
use crate::registry::{Delivery, RoomKind, SYSTEM_ROOM};
use crate::services::conversations::{
    self, Conversation, ConversationError, ConversationKind, Role, RoomRecord,
};
use crate::services::messages::{self, HistoryQuery, MessageError};
use crate::services::{audit, friends, users};
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

/// Identity of the authenticated session driving a dispatch call.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub user_id: Uuid,
    pub username: String,
}

/// Frames owed to the sender, plus whether the connection should close.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub replies: Vec<Envelope>,
    pub close: bool,
}

impl DispatchResult {
    fn reply(envelope: Envelope) -> Self {
        Self { replies: vec![envelope], close: false }
    }

    fn none() -> Self {
        Self::default()
    }
}

fn internal_error() -> Envelope {
    Envelope::system("internal error")
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Route one decoded frame from an authenticated session.
pub async fn dispatch(state: &AppState, session: &SessionCtx, envelope: Envelope) -> DispatchResult {
    match envelope.kind {
        MessageKind::Text | MessageKind::Image | MessageKind::File => {
            handle_chat(state, session, &envelope).await
        }
        MessageKind::PrivateChat => handle_private_chat(state, session, &envelope).await,
        MessageKind::Join => handle_join(state, session, &envelope).await,
        MessageKind::Leave => handle_leave(state, session, &envelope).await,
        MessageKind::ExitRoom => handle_exit_room(state, session, &envelope).await,
        MessageKind::CreateRoom => handle_create_room(state, session, &envelope).await,
        MessageKind::ListRooms => handle_list_rooms(state).await,
        MessageKind::ListRoomUsers => handle_list_room_users(state, &envelope).await,
        MessageKind::RequestHistory => handle_history(state, session, &envelope).await,
        MessageKind::RequestLatestTimestamp => handle_latest_timestamp(state, &envelope).await,
        MessageKind::RecallMessage => handle_recall(state, session, &envelope).await,
        MessageKind::SetRoomAdmin => handle_set_admin(state, session, &envelope, true).await,
        MessageKind::RemoveRoomAdmin => handle_set_admin(state, session, &envelope, false).await,
        MessageKind::UpdateRoomSettings => handle_room_settings(state, session, &envelope).await,
        MessageKind::FriendRequest => handle_friend_request(state, session, &envelope).await,
        MessageKind::FriendRequestResponse => handle_friend_response(state, session, &envelope).await,
        MessageKind::Logout => DispatchResult { replies: vec![Envelope::system("logged out")], close: true },
        MessageKind::Register | MessageKind::Login | MessageKind::UuidAuth => {
            DispatchResult::reply(Envelope::system("already authenticated"))
        }
        _ => DispatchResult::reply(Envelope::system("unhandled message type")),
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// TEXT / IMAGE / FILE into an existing conversation.
async fn handle_chat(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: ChatPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad chat payload: {e}"))),
    };

    let conversation = match conversations::get(&state.pool, payload.conversation_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return DispatchResult::reply(Envelope::system("unknown conversation")),
        Err(e) => return storage_failure("chat: conversation lookup", &e),
    };
    match conversations::is_member(&state.pool, conversation.id, session.user_id).await {
        Ok(true) => {}
        Ok(false) => return DispatchResult::reply(Envelope::system("not a member of this conversation")),
        Err(e) => return storage_failure("chat: membership check", &e),
    }

    let is_nsfw = envelope.is_nsfw.unwrap_or(false);
    let saved = messages::save_message(
        &state.pool,
        conversation.id,
        session.user_id,
        wire_name(envelope.kind),
        &envelope.content,
        is_nsfw,
        envelope.iv.as_deref(),
        envelope.time,
    )
    .await;
    if let Err(e) = saved {
        return storage_failure("chat: persist", &e);
    }

    if envelope.kind == MessageKind::Image && is_nsfw {
        // Informational only: audited, still delivered.
        audit::record_nsfw(&state.pool, session.user_id, &payload.content, envelope.time);
    }

    let mut outbound = Envelope::new(envelope.kind, envelope.content.clone())
        .with_from(&session.username)
        .with_conversation(conversation.id)
        .with_time(envelope.time);
    outbound.is_nsfw = envelope.is_nsfw;
    outbound.iv = envelope.iv.clone();

    route_to_conversation(state, &conversation, &outbound, Some(session.user_id)).await;
    DispatchResult::none()
}

/// PRIVATE_CHAT: open (or reuse) the two-party conversation with a user.
async fn handle_private_chat(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: PrivateChatPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad private chat payload: {e}"))),
    };
    if payload.to == session.username {
        return DispatchResult::reply(Envelope::system("cannot open a private chat with yourself"));
    }

    let recipient_id = match users::id_of(&state.pool, &payload.to).await {
        Ok(Some(id)) => id,
        Ok(None) => return DispatchResult::reply(Envelope::system("unknown user")),
        Err(e) => return storage_failure("private chat: user lookup", &e),
    };

    let are_friends = match friends::are_friends(&state.pool, session.user_id, recipient_id).await {
        Ok(f) => f,
        Err(e) => return storage_failure("private chat: friendship check", &e),
    };
    if !are_friends {
        match friends::temp_chat_allowed(&state.pool, session.user_id, recipient_id).await {
            // Denied before anything is created or persisted.
            Ok(false) => {
                return DispatchResult::reply(Envelope::system(
                    "recipient does not accept temporary chats",
                ));
            }
            Ok(true) => {}
            Err(e) => return storage_failure("private chat: gate check", &e),
        }
    }

    let conversation = match conversations::get_or_create_private(
        &state.pool,
        (session.user_id, &session.username),
        (recipient_id, &payload.to),
        are_friends,
    )
    .await
    {
        Ok(c) => c,
        Err(e) => return storage_failure("private chat: conversation", &e),
    };

    let content = json!({ "conversation_id": conversation.id, "content": payload.content });
    if let Err(e) = messages::save_message(
        &state.pool,
        conversation.id,
        session.user_id,
        "TEXT",
        &content,
        false,
        None,
        envelope.time,
    )
    .await
    {
        return storage_failure("private chat: persist", &e);
    }

    let outbound = Envelope::new(MessageKind::Text, content)
        .with_from(&session.username)
        .with_conversation(conversation.id)
        .with_time(envelope.time);
    // NotDelivered means the recipient is offline; the message is already
    // persisted, so it is queued rather than lost.
    let _ = state.registry.send_to_username(&payload.to, &outbound).await;

    // The sender learns the conversation id from the echo.
    DispatchResult::reply(outbound)
}

// =============================================================================
// ROOM MEMBERSHIP
// =============================================================================

async fn handle_join(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: RoomPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad join payload: {e}"))),
    };

    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("join: room lookup", &e),
    };

    if !room.is_public {
        let member = match conversations::is_member(&state.pool, room.conversation_id, session.user_id).await {
            Ok(m) => m,
            Err(e) => return storage_failure("join: membership check", &e),
        };
        if !member {
            return DispatchResult::reply(Envelope::system("room is private"));
        }
    }

    if let Err(e) = conversations::join_room(&state.pool, &room, session.user_id).await {
        return storage_failure("join: durable membership", &e);
    }
    ensure_presence(state, &room).await;
    state.registry.join_room(session.user_id, room.conversation_id).await;

    let notice = Envelope::new(
        MessageKind::RoomMembersChanged,
        json!({ "room": room.name, "username": session.username, "change": "joined" }),
    )
    .with_from("server")
    .with_conversation(room.conversation_id);
    state
        .registry
        .broadcast_to_room(room.conversation_id, &notice, Some(session.user_id))
        .await;

    info!(user = %session.username, room = %room.name, "joined room");
    DispatchResult::reply(
        Envelope::new(MessageKind::Join, json!({ "room": room.name, "conversation_id": room.conversation_id }))
            .with_from("server")
            .with_conversation(room.conversation_id),
    )
}

/// LEAVE drops live presence only; durable membership stays.
async fn handle_leave(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: RoomPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad leave payload: {e}"))),
    };
    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("leave: room lookup", &e),
    };

    state.registry.leave_room(session.user_id, room.conversation_id).await;
    DispatchResult::reply(
        Envelope::new(MessageKind::Leave, json!({ "room": room.name }))
            .with_from("server")
            .with_conversation(room.conversation_id),
    )
}

/// EXIT_ROOM drops live presence and deletes durable membership.
async fn handle_exit_room(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: RoomPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad exit payload: {e}"))),
    };
    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("exit: room lookup", &e),
    };

    state.registry.leave_room(session.user_id, room.conversation_id).await;
    if let Err(e) = conversations::exit_room(&state.pool, &room, session.user_id).await {
        return storage_failure("exit: durable membership", &e);
    }

    let notice = Envelope::new(
        MessageKind::RoomMembersChanged,
        json!({ "room": room.name, "username": session.username, "change": "exited" }),
    )
    .with_from("server")
    .with_conversation(room.conversation_id);
    state
        .registry
        .broadcast_to_room(room.conversation_id, &notice, Some(session.user_id))
        .await;

    DispatchResult::reply(
        Envelope::new(MessageKind::ExitRoom, json!({ "room": room.name }))
            .with_from("server")
            .with_conversation(room.conversation_id),
    )
}

async fn handle_create_room(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: CreateRoomPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad create payload: {e}"))),
    };
    let name = payload.name.trim();
    if name.is_empty() {
        return DispatchResult::reply(Envelope::system("room name is required"));
    }
    if name == SYSTEM_ROOM {
        return DispatchResult::reply(Envelope::system("room name is reserved"));
    }

    let room = match conversations::create_room(&state.pool, name, payload.is_public, session.user_id).await {
        Ok(r) => r,
        Err(ConversationError::NameTaken) => {
            return DispatchResult::reply(Envelope::system("room name already exists"));
        }
        Err(e) => return storage_failure("create room", &e),
    };

    ensure_presence(state, &room).await;
    state.registry.join_room(session.user_id, room.conversation_id).await;

    info!(user = %session.username, room = %room.name, "created room");
    DispatchResult::reply(
        Envelope::new(
            MessageKind::CreateRoom,
            json!({ "room": room.name, "conversation_id": room.conversation_id, "is_public": room.is_public }),
        )
        .with_from("server")
        .with_conversation(room.conversation_id),
    )
}

// =============================================================================
// QUERIES
// =============================================================================

async fn handle_list_rooms(state: &AppState) -> DispatchResult {
    let rooms = match conversations::list_public_rooms(&state.pool).await {
        Ok(r) => r,
        Err(e) => return storage_failure("list rooms", &e),
    };

    let mut entries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let online = state.registry.room_member_names(room.conversation_id).await.len();
        entries.push(json!({
            "room": room.name,
            "conversation_id": room.conversation_id,
            "online": online,
        }));
    }
    DispatchResult::reply(Envelope::new(MessageKind::ListRooms, json!(entries)).with_from("server"))
}

async fn handle_list_room_users(state: &AppState, envelope: &Envelope) -> DispatchResult {
    let payload: RoomPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad list payload: {e}"))),
    };
    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("list users: room lookup", &e),
    };
    let members = match conversations::members(&state.pool, room.conversation_id).await {
        Ok(m) => m,
        Err(e) => return storage_failure("list users: members", &e),
    };

    let mut entries = Vec::with_capacity(members.len());
    for member in members {
        let online = state.registry.is_online(&member.username).await;
        entries.push(json!({
            "username": member.username,
            "role": member.role.as_str(),
            "online": online,
        }));
    }
    DispatchResult::reply(
        Envelope::new(MessageKind::ListRoomUsers, json!(entries))
            .with_from("server")
            .with_conversation(room.conversation_id),
    )
}

async fn handle_history(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: HistoryPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad history payload: {e}"))),
    };
    match conversations::is_member(&state.pool, payload.conversation_id, session.user_id).await {
        Ok(true) => {}
        Ok(false) => return DispatchResult::reply(Envelope::system("not a member of this conversation")),
        Err(e) => return storage_failure("history: membership check", &e),
    }

    let query = HistoryQuery::from_request(payload.since, payload.limit);
    let history = match messages::fetch_history(&state.pool, payload.conversation_id, query).await {
        Ok(h) => h,
        Err(e) => return storage_failure("history: fetch", &e),
    };
    let body = serde_json::to_value(&history).unwrap_or_default();
    DispatchResult::reply(
        Envelope::new(MessageKind::HistoryResponse, body)
            .with_from("server")
            .with_conversation(payload.conversation_id),
    )
}

async fn handle_latest_timestamp(state: &AppState, envelope: &Envelope) -> DispatchResult {
    let payload: ConversationPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad timestamp payload: {e}"))),
    };
    let latest = match messages::latest_timestamp(&state.pool, payload.conversation_id).await {
        Ok(ts) => ts,
        Err(e) => return storage_failure("latest timestamp", &e),
    };
    DispatchResult::reply(
        Envelope::new(MessageKind::LatestTimestamp, json!({ "latest": latest }))
            .with_from("server")
            .with_conversation(payload.conversation_id),
    )
}

// =============================================================================
// RECALL
// =============================================================================

async fn handle_recall(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: RecallPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad recall payload: {e}"))),
    };

    let conversation_id =
        match messages::recall_message(&state.pool, payload.message_id, session.user_id, now_ms()).await {
            Ok(id) => id,
            // Ownership and expiry are distinct, deliberate denial reasons.
            Err(MessageError::NotFound) => return DispatchResult::reply(Envelope::system("message not found")),
            Err(MessageError::NotOwner) => {
                return DispatchResult::reply(Envelope::system(
                    "only the original sender may recall a message",
                ));
            }
            Err(MessageError::RecallExpired) => {
                return DispatchResult::reply(Envelope::system("recall window expired"));
            }
            Err(e) => return storage_failure("recall", &e),
        };

    let notice = Envelope::new(
        MessageKind::RecallNotice,
        json!({ "message_id": payload.message_id, "by": session.username }),
    )
    .with_from("server")
    .with_conversation(conversation_id);

    if let Ok(Some(conversation)) = conversations::get(&state.pool, conversation_id).await {
        route_to_conversation(state, &conversation, &notice, Some(session.user_id)).await;
    }
    DispatchResult::reply(notice)
}

// =============================================================================
// ROOM ADMINISTRATION
// =============================================================================

async fn handle_set_admin(
    state: &AppState,
    session: &SessionCtx,
    envelope: &Envelope,
    grant: bool,
) -> DispatchResult {
    let payload: RoomAdminPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad admin payload: {e}"))),
    };
    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("admin: room lookup", &e),
    };

    match conversations::role_of(&state.pool, room.conversation_id, session.user_id).await {
        Ok(Some(Role::Owner)) => {}
        Ok(Some(_)) => {
            return DispatchResult::reply(Envelope::system("only the room owner may manage admins"));
        }
        Ok(None) => return DispatchResult::reply(Envelope::system("not a member of this room")),
        Err(e) => return storage_failure("admin: role check", &e),
    }

    let target = match users::id_of(&state.pool, &payload.username).await {
        Ok(Some(id)) => id,
        Ok(None) => return DispatchResult::reply(Envelope::system("unknown user")),
        Err(e) => return storage_failure("admin: user lookup", &e),
    };

    match conversations::set_admin(&state.pool, room.conversation_id, target, grant).await {
        Ok(()) => {}
        // Covers both non-members and the undemotable owner.
        Err(ConversationError::NotFound) => {
            return DispatchResult::reply(Envelope::system("user is not an adjustable member of this room"));
        }
        Err(e) => return storage_failure("admin: role update", &e),
    }

    let role = if grant { Role::Admin } else { Role::Member };
    let notice = Envelope::new(
        MessageKind::RoomMembersChanged,
        json!({ "room": room.name, "username": payload.username, "role": role.as_str() }),
    )
    .with_from("server")
    .with_conversation(room.conversation_id);
    state.registry.broadcast_to_room(room.conversation_id, &notice, None).await;

    DispatchResult::none()
}

async fn handle_room_settings(
    state: &AppState,
    session: &SessionCtx,
    envelope: &Envelope,
) -> DispatchResult {
    let payload: RoomSettingsPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad settings payload: {e}"))),
    };
    if payload.allow_temp_chats.is_none() && payload.is_public.is_none() {
        return DispatchResult::reply(Envelope::system("no settings provided"));
    }

    let room = match conversations::find_room(&state.pool, &payload.room).await {
        Ok(Some(r)) => r,
        Ok(None) => return DispatchResult::reply(Envelope::system("room not found")),
        Err(e) => return storage_failure("settings: room lookup", &e),
    };

    match conversations::role_of(&state.pool, room.conversation_id, session.user_id).await {
        Ok(Some(role)) if role.can_administrate() => {}
        Ok(Some(_)) => {
            return DispatchResult::reply(Envelope::system("admin or owner required"));
        }
        Ok(None) => return DispatchResult::reply(Envelope::system("not a member of this room")),
        Err(e) => return storage_failure("settings: role check", &e),
    }

    match conversations::update_room_settings(
        &state.pool,
        room.room_id,
        payload.allow_temp_chats,
        payload.is_public,
    )
    .await
    {
        Ok(()) => {}
        Err(ConversationError::NotFound) => {
            return DispatchResult::reply(Envelope::system("room not found"));
        }
        Err(e) => return storage_failure("settings: update", &e),
    }

    info!(user = %session.username, room = %room.name, "room settings updated");
    DispatchResult::reply(Envelope::system("room settings updated"))
}

// =============================================================================
// FRIENDS
// =============================================================================

async fn handle_friend_request(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: FriendRequestPayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad friend request payload: {e}"))),
    };
    if payload.to == session.username {
        return DispatchResult::reply(Envelope::system("cannot befriend yourself"));
    }
    let recipient = match users::id_of(&state.pool, &payload.to).await {
        Ok(Some(id)) => id,
        Ok(None) => return DispatchResult::reply(Envelope::system("unknown user")),
        Err(e) => return storage_failure("friend request: user lookup", &e),
    };

    match friends::send_request(&state.pool, session.user_id, recipient).await {
        Ok(friends::RequestOutcome::Sent(request_id)) => {
            let notice = Envelope::new(
                MessageKind::FriendRequest,
                json!({ "request_id": request_id, "from": session.username }),
            )
            .with_from("server");
            let _ = state.registry.send_to_username(&payload.to, &notice).await;
            DispatchResult::reply(Envelope::system("friend request sent"))
        }
        Ok(friends::RequestOutcome::AlreadyPending) => {
            DispatchResult::reply(Envelope::system("friend request already pending"))
        }
        Ok(friends::RequestOutcome::AlreadyFriends) => {
            DispatchResult::reply(Envelope::system("already friends"))
        }
        Err(e) => storage_failure("friend request: send", &e),
    }
}

async fn handle_friend_response(state: &AppState, session: &SessionCtx, envelope: &Envelope) -> DispatchResult {
    let payload: FriendResponsePayload = match envelope.payload() {
        Ok(p) => p,
        Err(e) => return DispatchResult::reply(Envelope::system(format!("bad friend response payload: {e}"))),
    };

    let resolved =
        match friends::respond(&state.pool, payload.request_id, session.user_id, payload.accept).await {
            Ok(r) => r,
            Err(friends::FriendError::NotFound) => {
                return DispatchResult::reply(Envelope::system("no pending request to respond to"));
            }
            Err(e) => return storage_failure("friend response", &e),
        };

    let notice = Envelope::new(
        MessageKind::FriendRequestResponse,
        json!({
            "request_id": payload.request_id,
            "accepted": resolved.accepted,
            "by": session.username,
        }),
    )
    .with_from("server");
    let _ = state.registry.send_to_user(resolved.from_user, &notice).await;

    let verdict = if resolved.accepted { "friend request accepted" } else { "friend request rejected" };
    DispatchResult::reply(Envelope::system(verdict))
}

// =============================================================================
// HELPERS
// =============================================================================

/// Fan an envelope out to a conversation's delivery targets: the room's
/// live members for ROOM, the other party for FRIEND/TEMP.
async fn route_to_conversation(
    state: &AppState,
    conversation: &Conversation,
    envelope: &Envelope,
    exclude: Option<Uuid>,
) {
    match conversation.kind {
        ConversationKind::Room => {
            state.registry.broadcast_to_room(conversation.id, envelope, exclude).await;
        }
        ConversationKind::Friend | ConversationKind::Temp => {
            let members = match conversations::members(&state.pool, conversation.id).await {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, conversation_id = conversation.id, "routing: member lookup failed");
                    return;
                }
            };
            for member in members {
                if exclude == Some(member.user_id) {
                    continue;
                }
                if state.registry.send_to_user(member.user_id, envelope).await == Delivery::NotDelivered {
                    // Offline recipient: already persisted, nothing to do.
                    info!(to = %member.username, "recipient offline; message queued in history");
                }
            }
        }
    }
}

/// Make sure the registry knows a room before presence operations.
async fn ensure_presence(state: &AppState, room: &RoomRecord) {
    let kind = if room.is_public { RoomKind::Public } else { RoomKind::Private };
    state.registry.create_room(room.conversation_id, &room.name, kind).await;
}

fn storage_failure(context: &str, error: &dyn std::error::Error) -> DispatchResult {
    error!(error = %error, context, "storage failure during dispatch");
    DispatchResult::reply(internal_error())
}

fn wire_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Image => "IMAGE",
        MessageKind::File => "FILE",
        _ => "TEXT",
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
