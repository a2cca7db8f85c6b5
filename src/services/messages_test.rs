use super::*;

// =============================================================================
// recall_verdict
// =============================================================================

#[test]
fn recall_at_exact_window_boundary_is_accepted() {
    let user = Uuid::new_v4();
    let t = 1_000_000;
    assert!(recall_verdict(user, user, t, t + RECALL_WINDOW_MS).is_ok());
}

#[test]
fn recall_one_second_past_window_is_expired() {
    let user = Uuid::new_v4();
    let t = 1_000_000;
    assert!(matches!(
        recall_verdict(user, user, t, t + RECALL_WINDOW_MS + 1_000),
        Err(MessageError::RecallExpired)
    ));
}

#[test]
fn recall_by_non_author_is_ownership_error() {
    let sender = Uuid::new_v4();
    let intruder = Uuid::new_v4();
    let t = 1_000_000;
    // Ownership wins even when the window has also expired.
    assert!(matches!(
        recall_verdict(intruder, sender, t, t + RECALL_WINDOW_MS + 1_000),
        Err(MessageError::NotOwner)
    ));
    assert!(matches!(
        recall_verdict(intruder, sender, t, t),
        Err(MessageError::NotOwner)
    ));
}

#[test]
fn recall_immediately_is_accepted() {
    let user = Uuid::new_v4();
    assert!(recall_verdict(user, user, 500, 500).is_ok());
}

#[test]
fn recall_tolerates_clock_skew_backwards() {
    // A message stamped slightly in the future must not overflow.
    let user = Uuid::new_v4();
    assert!(recall_verdict(user, user, 10_000, 9_000).is_ok());
}

// =============================================================================
// HistoryQuery::from_request
// =============================================================================

#[test]
fn valid_since_selects_since_mode() {
    assert!(matches!(HistoryQuery::from_request(Some(12345), Some(10)), HistoryQuery::Since(12345)));
}

#[test]
fn missing_or_invalid_since_selects_last_n() {
    assert!(matches!(HistoryQuery::from_request(None, None), HistoryQuery::LastN(50)));
    assert!(matches!(HistoryQuery::from_request(Some(0), None), HistoryQuery::LastN(50)));
    assert!(matches!(HistoryQuery::from_request(Some(-5), Some(10)), HistoryQuery::LastN(10)));
}

#[test]
fn limit_is_clamped() {
    assert!(matches!(HistoryQuery::from_request(None, Some(10_000)), HistoryQuery::LastN(200)));
    assert!(matches!(HistoryQuery::from_request(None, Some(0)), HistoryQuery::LastN(1)));
}

// =============================================================================
// live-db coverage
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::services::{conversations, users};
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;

    async fn pool() -> PgPool {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL for live tests");
        PgPoolOptions::new().connect(&url).await.expect("connect")
    }

    #[tokio::test]
    async fn history_since_and_last_n_agree_on_order() {
        let pool = pool().await;
        let name = format!("u-{}", Uuid::new_v4());
        let sender = users::create_user(&pool, &name, "pw").await.expect("user");
        let room = conversations::create_room(&pool, &format!("r-{}", Uuid::new_v4()), true, sender)
            .await
            .expect("room");

        for (i, body) in ["one", "two", "three"].iter().enumerate() {
            save_message(&pool, room.conversation_id, sender, "TEXT", &json!(body), false, None, 1000 + i as i64)
                .await
                .expect("save");
        }

        let last = fetch_history(&pool, room.conversation_id, HistoryQuery::LastN(2))
            .await
            .expect("history");
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].content, json!("two"));
        assert_eq!(last[1].content, json!("three"));

        let since = fetch_history(&pool, room.conversation_id, HistoryQuery::Since(1000))
            .await
            .expect("history");
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].content, json!("two"));

        assert_eq!(
            latest_timestamp(&pool, room.conversation_id).await.expect("latest"),
            Some(1002)
        );
    }

    #[tokio::test]
    async fn recall_marks_row_and_enforces_checks() {
        let pool = pool().await;
        let sender = users::create_user(&pool, &format!("u-{}", Uuid::new_v4()), "pw")
            .await
            .expect("user");
        let other = users::create_user(&pool, &format!("u-{}", Uuid::new_v4()), "pw")
            .await
            .expect("user");
        let room = conversations::create_room(&pool, &format!("r-{}", Uuid::new_v4()), true, sender)
            .await
            .expect("room");
        let id = save_message(&pool, room.conversation_id, sender, "TEXT", &json!("oops"), false, None, 1000)
            .await
            .expect("save");

        assert!(matches!(
            recall_message(&pool, id, other, 1000).await,
            Err(MessageError::NotOwner)
        ));
        assert!(matches!(
            recall_message(&pool, id, sender, 1000 + RECALL_WINDOW_MS + 1).await,
            Err(MessageError::RecallExpired)
        ));
        let conversation = recall_message(&pool, id, sender, 1000 + RECALL_WINDOW_MS)
            .await
            .expect("recall");
        assert_eq!(conversation, room.conversation_id);
    }
}
