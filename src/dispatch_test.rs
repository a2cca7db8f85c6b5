use super::*;
use crate::state::test_helpers;
use serde_json::json;

fn session() -> SessionCtx {
    SessionCtx { user_id: Uuid::new_v4(), username: "alice".into() }
}

// =============================================================================
// control frames
// =============================================================================

#[tokio::test]
async fn logout_closes_the_connection() {
    let state = test_helpers::test_app_state();
    let result = dispatch(&state, &session(), Envelope::new(MessageKind::Logout, json!(null))).await;
    assert!(result.close);
    assert_eq!(result.replies.len(), 1);
    assert_eq!(result.replies[0].kind, MessageKind::System);
}

#[tokio::test]
async fn re_authentication_is_refused_without_closing() {
    let state = test_helpers::test_app_state();
    for kind in [MessageKind::Register, MessageKind::Login, MessageKind::UuidAuth] {
        let result = dispatch(&state, &session(), Envelope::new(kind, json!(null))).await;
        assert!(!result.close);
        assert_eq!(result.replies[0].text(), Some("already authenticated"));
    }
}

#[tokio::test]
async fn unknown_kind_gets_explicit_unhandled_reply() {
    let state = test_helpers::test_app_state();
    let envelope = crate::message::decode(r#"{"type":"TELEPORT","content":{}}"#).expect("decode");
    assert_eq!(envelope.kind, MessageKind::Unknown);
    let result = dispatch(&state, &session(), envelope).await;
    assert!(!result.close);
    assert_eq!(result.replies[0].text(), Some("unhandled message type"));
}

// =============================================================================
// payload validation happens before any storage access
// =============================================================================

#[tokio::test]
async fn chat_with_malformed_payload_reports_the_defect() {
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::Text, json!({"content": "hi"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert!(!result.close);
    let text = result.replies[0].text().expect("text reply");
    assert!(text.starts_with("bad chat payload"), "got: {text}");
}

#[tokio::test]
async fn private_chat_to_self_is_rejected() {
    let state = test_helpers::test_app_state();
    let envelope =
        Envelope::new(MessageKind::PrivateChat, json!({"to": "alice", "content": "hi me"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert_eq!(result.replies[0].text(), Some("cannot open a private chat with yourself"));
}

#[tokio::test]
async fn friend_request_to_self_is_rejected() {
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::FriendRequest, json!({"to": "alice"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert_eq!(result.replies[0].text(), Some("cannot befriend yourself"));
}

#[tokio::test]
async fn create_room_requires_a_name() {
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::CreateRoom, json!({"name": "   "}));
    let result = dispatch(&state, &session(), envelope).await;
    assert_eq!(result.replies[0].text(), Some("room name is required"));
}

#[tokio::test]
async fn create_room_refuses_the_reserved_name() {
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::CreateRoom, json!({"name": "system"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert_eq!(result.replies[0].text(), Some("room name is reserved"));
}

#[tokio::test]
async fn settings_update_with_nothing_to_change_is_refused() {
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::UpdateRoomSettings, json!({"room": "lobby"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert_eq!(result.replies[0].text(), Some("no settings provided"));
}

// =============================================================================
// storage failure stays generic
// =============================================================================

#[tokio::test]
async fn storage_failure_surfaces_as_internal_error() {
    // The lazy test pool points at nothing, so the first query fails.
    let state = test_helpers::test_app_state();
    let envelope = Envelope::new(MessageKind::Text, json!({"conversation_id": 1, "content": "hi"}));
    let result = dispatch(&state, &session(), envelope).await;
    assert!(!result.close);
    assert_eq!(result.replies[0].text(), Some("internal error"));
}

#[test]
fn stored_kind_collapses_to_the_three_chat_kinds() {
    assert_eq!(wire_name(MessageKind::Text), "TEXT");
    assert_eq!(wire_name(MessageKind::Image), "IMAGE");
    assert_eq!(wire_name(MessageKind::File), "FILE");
    assert_eq!(wire_name(MessageKind::PrivateChat), "TEXT");
}

// =============================================================================
// live-db coverage
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::registry::RegisterOutcome;
    use crate::services::users;
    use crate::state::AppState;
    use sqlx::postgres::PgPoolOptions;
    use tokio::sync::mpsc;

    async fn live_state() -> AppState {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL for live tests");
        let pool = PgPoolOptions::new().connect(&url).await.expect("connect");
        AppState::new(pool, crate::config::ServiceConfig::default())
    }

    async fn connected_user(state: &AppState) -> (SessionCtx, mpsc::Receiver<Envelope>) {
        let name = format!("u-{}", Uuid::new_v4());
        let user_id = users::create_user(&state.pool, &name, "pw").await.expect("user");
        let (tx, rx) = crate::registry::SessionRegistry::session_channel();
        let outcome = state.registry.register_session(user_id, &name, tx).await;
        assert!(matches!(outcome, RegisterOutcome::Registered));
        (SessionCtx { user_id, username: name }, rx)
    }

    #[tokio::test]
    async fn create_join_chat_reaches_the_other_member() {
        let state = live_state().await;
        let (alice, _alice_rx) = connected_user(&state).await;
        let (bob, mut bob_rx) = connected_user(&state).await;

        let room_name = format!("room-{}", Uuid::new_v4());
        let created = dispatch(
            &state,
            &alice,
            Envelope::new(MessageKind::CreateRoom, json!({"name": room_name})),
        )
        .await;
        let conversation_id = created.replies[0].conversation_id.expect("conversation id");

        let joined =
            dispatch(&state, &bob, Envelope::new(MessageKind::Join, json!({"room": room_name}))).await;
        assert_eq!(joined.replies[0].kind, MessageKind::Join);

        let sent = dispatch(
            &state,
            &alice,
            Envelope::new(
                MessageKind::Text,
                json!({"conversation_id": conversation_id, "content": "hello"}),
            ),
        )
        .await;
        assert!(sent.replies.is_empty());

        let delivered = bob_rx.recv().await.expect("bob receives");
        assert_eq!(delivered.kind, MessageKind::Text);
        assert_eq!(delivered.from.as_deref(), Some(alice.username.as_str()));
        assert_eq!(delivered.conversation_id, Some(conversation_id));
    }

    #[tokio::test]
    async fn chat_into_unjoined_conversation_is_refused() {
        let state = live_state().await;
        let (alice, _rx) = connected_user(&state).await;
        let (bob, _bob_rx) = connected_user(&state).await;

        let room_name = format!("room-{}", Uuid::new_v4());
        let created = dispatch(
            &state,
            &alice,
            Envelope::new(MessageKind::CreateRoom, json!({"name": room_name})),
        )
        .await;
        let conversation_id = created.replies[0].conversation_id.expect("conversation id");

        let result = dispatch(
            &state,
            &bob,
            Envelope::new(
                MessageKind::Text,
                json!({"conversation_id": conversation_id, "content": "sneaky"}),
            ),
        )
        .await;
        assert_eq!(result.replies[0].text(), Some("not a member of this conversation"));
    }

    #[tokio::test]
    async fn admin_grant_requires_the_owner() {
        let state = live_state().await;
        let (alice, _a_rx) = connected_user(&state).await;
        let (bob, _b_rx) = connected_user(&state).await;

        let room_name = format!("room-{}", Uuid::new_v4());
        dispatch(&state, &alice, Envelope::new(MessageKind::CreateRoom, json!({"name": room_name})))
            .await;
        dispatch(&state, &bob, Envelope::new(MessageKind::Join, json!({"room": room_name}))).await;

        let refused = dispatch(
            &state,
            &bob,
            Envelope::new(
                MessageKind::SetRoomAdmin,
                json!({"room": room_name, "username": alice.username}),
            ),
        )
        .await;
        assert_eq!(refused.replies[0].text(), Some("only the room owner may manage admins"));

        let granted = dispatch(
            &state,
            &alice,
            Envelope::new(
                MessageKind::SetRoomAdmin,
                json!({"room": room_name, "username": bob.username}),
            ),
        )
        .await;
        assert!(granted.replies.is_empty());
    }

    #[tokio::test]
    async fn settings_update_requires_admin_or_owner() {
        let state = live_state().await;
        let (alice, _a_rx) = connected_user(&state).await;
        let (bob, _b_rx) = connected_user(&state).await;

        let room_name = format!("room-{}", Uuid::new_v4());
        dispatch(&state, &alice, Envelope::new(MessageKind::CreateRoom, json!({"name": room_name})))
            .await;
        dispatch(&state, &bob, Envelope::new(MessageKind::Join, json!({"room": room_name}))).await;

        let refused = dispatch(
            &state,
            &bob,
            Envelope::new(
                MessageKind::UpdateRoomSettings,
                json!({"room": room_name, "allow_temp_chats": false}),
            ),
        )
        .await;
        assert_eq!(refused.replies[0].text(), Some("admin or owner required"));

        // Granting ADMIN makes the same update legal.
        dispatch(
            &state,
            &alice,
            Envelope::new(
                MessageKind::SetRoomAdmin,
                json!({"room": room_name, "username": bob.username}),
            ),
        )
        .await;
        let updated = dispatch(
            &state,
            &bob,
            Envelope::new(
                MessageKind::UpdateRoomSettings,
                json!({"room": room_name, "allow_temp_chats": false}),
            ),
        )
        .await;
        assert_eq!(updated.replies[0].text(), Some("room settings updated"));
    }

    #[tokio::test]
    async fn recall_notice_reaches_sender_and_room() {
        let state = live_state().await;
        let (alice, mut alice_rx) = connected_user(&state).await;
        let (bob, mut bob_rx) = connected_user(&state).await;

        let room_name = format!("room-{}", Uuid::new_v4());
        let created = dispatch(
            &state,
            &alice,
            Envelope::new(MessageKind::CreateRoom, json!({"name": room_name})),
        )
        .await;
        let conversation_id = created.replies[0].conversation_id.expect("conversation id");
        dispatch(&state, &bob, Envelope::new(MessageKind::Join, json!({"room": room_name}))).await;

        dispatch(
            &state,
            &alice,
            Envelope::new(
                MessageKind::Text,
                json!({"conversation_id": conversation_id, "content": "oops"}),
            ),
        )
        .await;
        let delivered = bob_rx.recv().await.expect("delivery");
        assert_eq!(delivered.kind, MessageKind::Text);

        // The message id comes from history since send returns no reply.
        let history = dispatch(
            &state,
            &alice,
            Envelope::new(MessageKind::RequestHistory, json!({"conversation_id": conversation_id})),
        )
        .await;
        let body = &history.replies[0].content;
        let message_id = body[0]["id"].as_i64().expect("message id");

        let recalled = dispatch(
            &state,
            &alice,
            Envelope::new(MessageKind::RecallMessage, json!({"message_id": message_id})),
        )
        .await;
        assert_eq!(recalled.replies[0].kind, MessageKind::RecallNotice);

        let notice = bob_rx.recv().await.expect("bob notice");
        assert_eq!(notice.kind, MessageKind::RecallNotice);
        assert!(alice_rx.try_recv().is_err(), "sender gets the notice as a reply, not a broadcast");
    }
}
