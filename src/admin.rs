//! Admin operations: TLD and job CRUD.
//!
//! All writes are idempotent upserts keyed on the natural unique columns
//! (`tlds.name`, `jobs.(tld, kind)`), so repeating an admin command is
//! safe. Toggling `is_enabled`/`is_active` takes effect on the next
//! scheduler tick — the dispatcher re-reads jobs when it starts and the
//! coordinator re-checks the TLD row per cycle.

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::{Job, JobKind, Tld};

/// Default daily schedule: 02:00 UTC (seconds-first cron).
pub const DEFAULT_SCHEDULE: &str = "0 0 2 * * *";

/// Create or update a tracked TLD. Returns the stored row.
pub async fn upsert_tld(
    pool: &SqlitePool,
    name: &str,
    display_name: Option<&str>,
) -> Result<Tld> {
    let name = normalize_tld(name)?;
    let now = Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO tlds (name, display_name, is_active, created_at, updated_at)
        VALUES (?, ?, 1, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            display_name = COALESCE(excluded.display_name, tlds.display_name),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&name)
    .bind(display_name)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_tld(pool, &name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("TLD upsert did not persist"))
}

pub async fn get_tld(pool: &SqlitePool, name: &str) -> Result<Option<Tld>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, display_name, is_active, last_import_date, last_drop_count,
               created_at, updated_at
        FROM tlds WHERE name = ?
        "#,
    )
    .bind(name.to_ascii_lowercase())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(row_to_tld).transpose()?)
}

pub async fn list_tlds(pool: &SqlitePool) -> Result<Vec<Tld>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, display_name, is_active, last_import_date, last_drop_count,
               created_at, updated_at
        FROM tlds ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_tld).collect()
}

/// Enable or disable a TLD. Disabled TLDs are refused by the coordinator.
pub async fn set_tld_active(pool: &SqlitePool, name: &str, active: bool) -> Result<()> {
    let result = sqlx::query("UPDATE tlds SET is_active = ?, updated_at = ? WHERE name = ?")
        .bind(active as i64)
        .bind(Utc::now().timestamp())
        .bind(name.to_ascii_lowercase())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        bail!("unknown TLD: {}", name);
    }
    Ok(())
}

fn row_to_tld(row: sqlx::sqlite::SqliteRow) -> Result<Tld> {
    let last_import: Option<String> = row.get("last_import_date");
    Ok(Tld {
        id: row.get("id"),
        name: row.get("name"),
        display_name: row.get("display_name"),
        is_active: row.get::<i64, _>("is_active") != 0,
        last_import_date: last_import
            .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
            .transpose()?,
        last_drop_count: row.get("last_drop_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn normalize_tld(name: &str) -> Result<String> {
    let name = name.trim().trim_start_matches('.').to_ascii_lowercase();
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        bail!("invalid TLD name: '{}'", name);
    }
    Ok(name)
}

/// Parameters for a job upsert; `None` keeps the column default.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub schedule: Option<String>,
    pub timeout_secs: Option<i64>,
    pub max_retries: Option<i64>,
    pub backoff_base_secs: Option<i64>,
}

/// Create or update the `(tld, kind)` job.
pub async fn upsert_job(
    pool: &SqlitePool,
    tld: &str,
    kind: JobKind,
    spec: &JobSpec,
) -> Result<Job> {
    let tld = normalize_tld(tld)?;
    if get_tld(pool, &tld).await?.is_none() {
        bail!("TLD '{}' is not tracked (add it first)", tld);
    }

    let schedule = spec.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE);
    validate_schedule(schedule)?;
    let now = Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO jobs (tld, kind, schedule, is_enabled, timeout_secs, max_retries,
                          backoff_base_secs, created_at, updated_at)
        VALUES (?, ?, ?, 1, COALESCE(?, 7200), COALESCE(?, 3), COALESCE(?, 30), ?, ?)
        ON CONFLICT(tld, kind) DO UPDATE SET
            schedule = excluded.schedule,
            timeout_secs = COALESCE(?, jobs.timeout_secs),
            max_retries = COALESCE(?, jobs.max_retries),
            backoff_base_secs = COALESCE(?, jobs.backoff_base_secs),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&tld)
    .bind(kind.as_str())
    .bind(schedule)
    .bind(spec.timeout_secs)
    .bind(spec.max_retries)
    .bind(spec.backoff_base_secs)
    .bind(now)
    .bind(now)
    .bind(spec.timeout_secs)
    .bind(spec.max_retries)
    .bind(spec.backoff_base_secs)
    .execute(pool)
    .await?;

    get_job(pool, &tld, kind)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job upsert did not persist"))
}

pub async fn get_job(pool: &SqlitePool, tld: &str, kind: JobKind) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"
        SELECT id, tld, kind, schedule, is_enabled, timeout_secs, max_retries, backoff_base_secs
        FROM jobs WHERE tld = ? AND kind = ?
        "#,
    )
    .bind(tld.to_ascii_lowercase())
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(row_to_job).transpose()
}

pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        SELECT id, tld, kind, schedule, is_enabled, timeout_secs, max_retries, backoff_base_secs
        FROM jobs ORDER BY tld, kind
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_job).collect()
}

pub async fn set_job_enabled(
    pool: &SqlitePool,
    tld: &str,
    kind: JobKind,
    enabled: bool,
) -> Result<()> {
    let result = sqlx::query("UPDATE jobs SET is_enabled = ?, updated_at = ? WHERE tld = ? AND kind = ?")
        .bind(enabled as i64)
        .bind(Utc::now().timestamp())
        .bind(tld.to_ascii_lowercase())
        .bind(kind.as_str())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        bail!("no {} job for TLD '{}'", kind, tld);
    }
    Ok(())
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let kind_str: String = row.get("kind");
    Ok(Job {
        id: row.get("id"),
        tld: row.get("tld"),
        kind: JobKind::from_str(&kind_str).map_err(|e| anyhow::anyhow!(e))?,
        schedule: row.get("schedule"),
        is_enabled: row.get::<i64, _>("is_enabled") != 0,
        timeout_secs: row.get("timeout_secs"),
        max_retries: row.get("max_retries"),
        backoff_base_secs: row.get("backoff_base_secs"),
    })
}

/// Reject malformed cron expressions at admin time instead of scheduler
/// startup (where they would be a config error).
fn validate_schedule(schedule: &str) -> Result<()> {
    let fields = schedule.split_whitespace().count();
    if !(6..=7).contains(&fields) {
        bail!(
            "invalid cron expression '{}': expected 6 fields (sec min hour dom mon dow)",
            schedule
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(dir: &std::path::Path) -> Config {
        let toml = format!(
            r#"[db]
path = "{0}/zonedrop.sqlite"

[storage]
data_dir = "{0}"
"#,
            dir.display()
        );
        let path = dir.join("zonedrop.toml");
        std::fs::write(&path, toml).unwrap();
        crate::config::load_config(&path).unwrap()
    }

    async fn test_pool(dir: &std::path::Path) -> SqlitePool {
        let config = test_config(dir);
        crate::migrate::run_migrations(&config).await.unwrap();
        crate::db::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn tld_upsert_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;

        let first = upsert_tld(&pool, "Dev", Some(".dev domains")).await.unwrap();
        let second = upsert_tld(&pool, "dev", None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "dev");
        assert_eq!(second.display_name.as_deref(), Some(".dev domains"));
        assert_eq!(list_tlds(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tld_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;

        upsert_tld(&pool, "dev", None).await.unwrap();
        set_tld_active(&pool, "dev", false).await.unwrap();
        let tld = get_tld(&pool, "dev").await.unwrap().unwrap();
        assert!(!tld.is_active);

        assert!(set_tld_active(&pool, "nope", true).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_tld_names() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;

        assert!(upsert_tld(&pool, "", None).await.is_err());
        assert!(upsert_tld(&pool, "has space", None).await.is_err());
        assert!(upsert_tld(&pool, "Ok", None).await.is_ok());
    }

    #[tokio::test]
    async fn job_upsert_requires_tracked_tld() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;

        let err = upsert_job(&pool, "dev", JobKind::Full, &JobSpec::default()).await;
        assert!(err.is_err());

        upsert_tld(&pool, "dev", None).await.unwrap();
        let job = upsert_job(&pool, "dev", JobKind::Full, &JobSpec::default())
            .await
            .unwrap();
        assert_eq!(job.schedule, DEFAULT_SCHEDULE);
        assert_eq!(job.timeout_secs, 7200);
        assert_eq!(job.max_retries, 3);
    }

    #[tokio::test]
    async fn job_upsert_updates_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;
        upsert_tld(&pool, "dev", None).await.unwrap();

        let first = upsert_job(&pool, "dev", JobKind::Full, &JobSpec::default())
            .await
            .unwrap();
        let second = upsert_job(
            &pool,
            "dev",
            JobKind::Full,
            &JobSpec {
                schedule: Some("0 30 3 * * *".to_string()),
                max_retries: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.schedule, "0 30 3 * * *");
        assert_eq!(second.max_retries, 5);
        assert_eq!(second.timeout_secs, 7200);
    }

    #[tokio::test]
    async fn rejects_malformed_cron() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;
        upsert_tld(&pool, "dev", None).await.unwrap();

        let err = upsert_job(
            &pool,
            "dev",
            JobKind::Full,
            &JobSpec {
                schedule: Some("2am daily".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn job_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path()).await;
        upsert_tld(&pool, "dev", None).await.unwrap();
        upsert_job(&pool, "dev", JobKind::Full, &JobSpec::default())
            .await
            .unwrap();

        set_job_enabled(&pool, "dev", JobKind::Full, false).await.unwrap();
        let job = get_job(&pool, "dev", JobKind::Full).await.unwrap().unwrap();
        assert!(!job.is_enabled);
    }
}
