//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `zonedrop init`.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `tlds` | Tracked TLDs with last-import markers |
//! | `zone_snapshots` | Registry of committed daily snapshots |
//! | `drops` | Detected drops with derived metadata |
//! | `watchlists` | User pattern filters over drops |
//! | `watchlist_matches` | Deduplicated watchlist hits |
//! | `jobs` | Per-TLD cron descriptors |
//! | `job_runs` | Append-only execution log |
//! | `leases` | Single-flight guard per `(tld, target_date, kind)` |
//! | `notifications` | Queue drained by the external notifier |
//!
//! # Idempotency
//!
//! All statements use `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS`. Running `zonedrop init` multiple times is safe.

use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Run all database migrations. Safe to call repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tlds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_import_date TEXT,
            last_drop_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS zone_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tld TEXT NOT NULL,
            date TEXT NOT NULL,
            path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            UNIQUE(tld, date)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS drops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL,
            tld TEXT NOT NULL,
            drop_date TEXT NOT NULL,
            length INTEGER NOT NULL,
            label_count INTEGER NOT NULL DEFAULT 1,
            charset_type TEXT NOT NULL,
            quality_score INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(label, tld, drop_date)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watchlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            pattern_kind TEXT NOT NULL,
            pattern TEXT NOT NULL,
            min_length INTEGER,
            max_length INTEGER,
            allowed_tlds TEXT,
            allowed_charsets TEXT,
            min_quality INTEGER,
            disabled_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watchlist_matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            watchlist_id INTEGER NOT NULL,
            drop_id INTEGER NOT NULL,
            matched_at INTEGER NOT NULL,
            UNIQUE(watchlist_id, drop_id),
            FOREIGN KEY (watchlist_id) REFERENCES watchlists(id),
            FOREIGN KEY (drop_id) REFERENCES drops(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tld TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'full',
            schedule TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            timeout_secs INTEGER NOT NULL DEFAULT 7200,
            max_retries INTEGER NOT NULL DEFAULT 3,
            backoff_base_secs INTEGER NOT NULL DEFAULT 30,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tld, kind)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER,
            tld TEXT NOT NULL,
            kind TEXT NOT NULL,
            target_date TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            outcome TEXT NOT NULL,
            stats_json TEXT,
            error_class TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            tld TEXT NOT NULL,
            target_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            PRIMARY KEY (tld, target_date, kind)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            watchlist_id INTEGER NOT NULL,
            drop_id INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Indexes for the hot query paths
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_drops_tld_date ON drops(tld, drop_date)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_drops_date ON drops(drop_date DESC)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_drops_length ON drops(length)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_drops_charset ON drops(charset_type)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_runs_target ON job_runs(tld, target_date, kind)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_watchlists_active ON watchlists(is_active)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
