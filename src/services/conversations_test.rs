use super::*;

// =============================================================================
// kind / role parsing
// =============================================================================

#[test]
fn kind_round_trips_through_text() {
    for kind in [ConversationKind::Room, ConversationKind::Friend, ConversationKind::Temp] {
        assert_eq!(ConversationKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(ConversationKind::parse("GROUP"), None);
}

#[test]
fn role_round_trips_through_text() {
    for role in [Role::Owner, Role::Admin, Role::Member] {
        assert_eq!(Role::parse(role.as_str()), Some(role));
    }
    assert_eq!(Role::parse("owner"), None);
}

#[test]
fn administration_requires_owner_or_admin() {
    assert!(Role::Owner.can_administrate());
    assert!(Role::Admin.can_administrate());
    assert!(!Role::Member.can_administrate());
}

// =============================================================================
// pair_name
// =============================================================================

#[test]
fn pair_name_is_order_independent() {
    assert_eq!(pair_name("alice", "bob"), "alice:bob");
    assert_eq!(pair_name("bob", "alice"), "alice:bob");
}

#[test]
fn pair_name_handles_equal_names() {
    assert_eq!(pair_name("x", "x"), "x:x");
}

// =============================================================================
// live-db coverage
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::services::users;
    use sqlx::postgres::PgPoolOptions;

    async fn pool() -> PgPool {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL for live tests");
        PgPoolOptions::new().connect(&url).await.expect("connect")
    }

    async fn user(pool: &PgPool) -> (Uuid, String) {
        let name = format!("u-{}", Uuid::new_v4());
        let id = users::create_user(pool, &name, "pw").await.expect("user");
        (id, name)
    }

    #[tokio::test]
    async fn private_conversation_is_stable_and_upgrades_in_place() {
        let pool = pool().await;
        let (a_id, a_name) = user(&pool).await;
        let (b_id, b_name) = user(&pool).await;

        let first = get_or_create_private(&pool, (a_id, &a_name), (b_id, &b_name), false)
            .await
            .expect("create");
        assert_eq!(first.kind, ConversationKind::Temp);

        // Same pair in the opposite order returns the same conversation.
        let second = get_or_create_private(&pool, (b_id, &b_name), (a_id, &a_name), false)
            .await
            .expect("lookup");
        assert_eq!(second.id, first.id);

        // Friendship upgrades the existing conversation, same id.
        let upgraded = get_or_create_private(&pool, (a_id, &a_name), (b_id, &b_name), true)
            .await
            .expect("upgrade");
        assert_eq!(upgraded.id, first.id);
        assert_eq!(upgraded.kind, ConversationKind::Friend);
    }

    #[tokio::test]
    async fn create_room_rejects_duplicate_name() {
        let pool = pool().await;
        let (owner, _) = user(&pool).await;
        let name = format!("room-{}", Uuid::new_v4());
        create_room(&pool, &name, true, owner).await.expect("create");
        assert!(matches!(
            create_room(&pool, &name, true, owner).await,
            Err(ConversationError::NameTaken)
        ));
    }

    #[tokio::test]
    async fn join_twice_does_not_duplicate_membership() {
        let pool = pool().await;
        let (owner, _) = user(&pool).await;
        let (joiner, _) = user(&pool).await;
        let name = format!("room-{}", Uuid::new_v4());
        let room = create_room(&pool, &name, true, owner).await.expect("create");

        join_room(&pool, &room, joiner).await.expect("join");
        join_room(&pool, &room, joiner).await.expect("rejoin");

        let member_rows = members(&pool, room.conversation_id).await.expect("members");
        assert_eq!(member_rows.iter().filter(|m| m.user_id == joiner).count(), 1);
    }

    #[tokio::test]
    async fn owner_cannot_be_demoted() {
        let pool = pool().await;
        let (owner, _) = user(&pool).await;
        let name = format!("room-{}", Uuid::new_v4());
        let room = create_room(&pool, &name, true, owner).await.expect("create");

        assert!(matches!(
            set_admin(&pool, room.conversation_id, owner, false).await,
            Err(ConversationError::NotFound)
        ));
        let role = role_of(&pool, room.conversation_id, owner).await.expect("role");
        assert_eq!(role, Some(Role::Owner));
    }
}
