//! Idempotent batch persistence of detected drops.
//!
//! Writes go through `INSERT OR IGNORE` on the `(label, tld, drop_date)`
//! unique key, in batches of [`DEFAULT_BATCH_SIZE`] per transaction.
//! Re-running a completed cycle therefore inserts nothing and skips
//! everything; a cycle interrupted mid-batch rolls back only the open
//! batch and resumes safely from the last committed boundary.
//!
//! TLD markers (`last_import_date`, `last_drop_count`) are updated by the
//! coordinator only after the whole cycle succeeds.

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::detect::NewDrop;
use crate::error::CycleError;
use crate::models::DropRecord;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// What one persist call did.
#[derive(Debug, Default)]
pub struct PersistOutcome {
    pub inserted: u64,
    pub skipped: u64,
    /// Newly inserted rows, in insertion order. The watchlist matcher's
    /// input; replayed (skipped) rows are deliberately absent.
    pub inserted_drops: Vec<DropRecord>,
}

/// Insert `records` in batches, skipping rows that already exist.
pub async fn persist_drops(
    pool: &SqlitePool,
    records: &[NewDrop],
    batch_size: usize,
) -> Result<PersistOutcome, CycleError> {
    let batch_size = batch_size.max(1);
    let mut outcome = PersistOutcome::default();
    let now = Utc::now().timestamp();

    for batch in records.chunks(batch_size) {
        let mut tx = pool.begin().await.map_err(CycleError::from_sqlx)?;

        for record in batch {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO drops
                    (label, tld, drop_date, length, label_count, charset_type, quality_score, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.label)
            .bind(&record.tld)
            .bind(record.drop_date.format("%Y-%m-%d").to_string())
            .bind(record.length)
            .bind(record.label_count)
            .bind(record.charset_type.as_str())
            .bind(record.quality_score)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(CycleError::from_sqlx)?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
                outcome.inserted_drops.push(DropRecord {
                    id: result.last_insert_rowid(),
                    label: record.label.clone(),
                    tld: record.tld.clone(),
                    drop_date: record.drop_date,
                    length: record.length,
                    label_count: record.label_count,
                    charset_type: record.charset_type,
                    quality_score: record.quality_score,
                    created_at: now,
                });
            } else {
                outcome.skipped += 1;
            }
        }

        tx.commit().await.map_err(CycleError::from_sqlx)?;
    }

    Ok(outcome)
}

/// Record a successful cycle on the TLD row.
pub async fn update_tld_markers(
    pool: &SqlitePool,
    tld: &str,
    date: NaiveDate,
    inserted: u64,
) -> Result<(), CycleError> {
    sqlx::query(
        r#"
        UPDATE tlds
        SET last_import_date = ?, last_drop_count = ?, updated_at = ?
        WHERE name = ?
        "#,
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(inserted as i64)
    .bind(Utc::now().timestamp())
    .bind(tld)
    .execute(pool)
    .await
    .map_err(CycleError::from_sqlx)?;

    Ok(())
}

/// Register a committed snapshot in the queryable metadata table.
pub async fn record_snapshot(
    pool: &SqlitePool,
    snapshot: &crate::models::ZoneSnapshot,
) -> Result<(), CycleError> {
    sqlx::query(
        r#"
        INSERT INTO zone_snapshots (tld, date, path, size_bytes, sha256, fetched_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(tld, date) DO UPDATE SET
            path = excluded.path,
            size_bytes = excluded.size_bytes,
            sha256 = excluded.sha256,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(&snapshot.tld)
    .bind(snapshot.date.format("%Y-%m-%d").to_string())
    .bind(&snapshot.path)
    .bind(snapshot.size_bytes)
    .bind(&snapshot.sha256)
    .bind(snapshot.fetched_at)
    .execute(pool)
    .await
    .map_err(CycleError::from_sqlx)?;

    Ok(())
}
