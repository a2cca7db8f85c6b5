//! NSFW audit trail.
//!
//! NSFW marking is informational: flagged images are still delivered, but
//! sender, image reference, and timestamp land in an audit table. The
//! insert is fire-and-forget so routing never waits on it.

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Record an NSFW-flagged image without blocking the caller.
pub fn record_nsfw(pool: &PgPool, sender_id: Uuid, image_ref: &str, logged_at: i64) {
    let pool = pool.clone();
    let image_ref = image_ref.to_owned();
    tokio::spawn(async move {
        let result = sqlx::query(
            "INSERT INTO nsfw_audit (sender_id, image_ref, logged_at) VALUES ($1, $2, $3)",
        )
        .bind(sender_id)
        .bind(&image_ref)
        .bind(logged_at)
        .execute(&pool)
        .await;
        if let Err(e) = result {
            warn!(error = %e, %sender_id, "nsfw audit insert failed");
        }
    });
}
