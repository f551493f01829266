//! SQLite connection pool.
//!
//! One database file holds everything: TLDs, snapshots metadata, drops,
//! watchlists, jobs, runs, leases, and the notification queue. WAL mode
//! lets per-TLD workers read (drop queries, watchlist loads) while another
//! worker's persist batch holds the write lock, and the busy timeout
//! covers the worst case of a 5,000-row batch commit. Foreign keys are
//! enforced so a pruned watchlist cannot leave dangling matches.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;

use crate::config::Config;

const BATCH_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let path = &config.db.path;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create database directory: {}", dir.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BATCH_BUSY_TIMEOUT);

    // Every worker runs its own cycle, plus one connection for the
    // dispatcher's catch-up and lease bookkeeping.
    let pool_size = config.scheduler.workers as u32 + 1;

    SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", path.display()))
}
