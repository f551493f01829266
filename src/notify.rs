//! Notification request sink.
//!
//! Watchlist matches become rows in the `notifications` queue; the actual
//! delivery transports (email, webhook, Telegram) live outside this crate
//! and drain rows in `queued` status. The payload carries everything a
//! transport needs so it never has to join back into the pipeline tables.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::DropRecord;

/// Enqueue one notification request for a watchlist hit.
pub async fn submit_notification(
    pool: &SqlitePool,
    user_id: i64,
    watchlist_id: i64,
    drop: &DropRecord,
) -> Result<()> {
    let payload = serde_json::json!({
        "user_id": user_id,
        "watchlist_id": watchlist_id,
        "drop": {
            "id": drop.id,
            "domain": drop.domain(),
            "label": drop.label,
            "tld": drop.tld,
            "drop_date": drop.drop_date.format("%Y-%m-%d").to_string(),
            "length": drop.length,
            "charset_type": drop.charset_type.as_str(),
            "quality_score": drop.quality_score,
        },
    });

    sqlx::query(
        r#"
        INSERT INTO notifications (user_id, watchlist_id, drop_id, payload_json, status, created_at)
        VALUES (?, ?, ?, ?, 'queued', ?)
        "#,
    )
    .bind(user_id)
    .bind(watchlist_id)
    .bind(drop.id)
    .bind(payload.to_string())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}
