//! Library-level pipeline tests: single-flight admission, watchlist
//! fan-out, and JobRun recording, on a real temp store and database.

use chrono::NaiveDate;
use sqlx::Row;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use zonedrop::config::{load_config, Config};
use zonedrop::models::{JobKind, RunOutcome};
use zonedrop::scheduler::{self, RunnerEnv, Ticket};
use zonedrop::{db, migrate, watchlist};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn test_config(root: &Path) -> Config {
    let toml = format!(
        r#"[db]
path = "{0}/data/zonedrop.sqlite"

[storage]
data_dir = "{0}/data"
"#,
        root.display()
    );
    let path = root.join("zonedrop.toml");
    fs::write(&path, toml).unwrap();
    load_config(&path).unwrap()
}

fn write_zone(root: &Path, tld: &str, compact_date: &str, owners: &[&str]) {
    let dir = root.join("data").join("zones").join(tld);
    fs::create_dir_all(&dir).unwrap();
    let mut body = String::new();
    for owner in owners {
        body.push_str(&format!("{} 300 IN NS ns1.example.\n", owner));
    }
    fs::write(dir.join(format!("{}.zone", compact_date)), body).unwrap();
}

async fn setup(root: &Path) -> (Config, sqlx::SqlitePool) {
    let config = test_config(root);
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    pool_add_tld(&pool, "net").await;
    (config, pool)
}

async fn pool_add_tld(pool: &sqlx::SqlitePool, name: &str) {
    zonedrop::admin::upsert_tld(pool, name, None).await.unwrap();
}

fn idle_shutdown() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    // Leak the sender so the channel stays open for the test's lifetime.
    std::mem::forget(tx);
    rx
}

/// S5: with the lease already held, a second submission of the same
/// `(tld, date, kind)` records a skipped run instead of executing.
#[tokio::test]
async fn single_flight_records_skipped_run() {
    let tmp = TempDir::new().unwrap();
    write_zone(tmp.path(), "net", "20250331", &["alpha.net.", "beta.net."]);
    write_zone(tmp.path(), "net", "20250401", &["alpha.net."]);
    let (config, pool) = setup(tmp.path()).await;

    let date = day(2025, 4, 1);
    assert!(scheduler::acquire_lease(&pool, "net", date, JobKind::Full)
        .await
        .unwrap());

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let ticket = Ticket::ad_hoc("net", JobKind::Full, date, &config);
    let result = scheduler::run_ticket(&env, &ticket, &idle_shutdown())
        .await
        .unwrap();
    assert_eq!(result.outcome, RunOutcome::Skipped);

    // No drops were recorded by the skipped run.
    let drops: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drops")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(drops, 0);

    // The holder releases and runs to completion.
    scheduler::release_lease(&pool, "net", date, JobKind::Full)
        .await
        .unwrap();
    let result = scheduler::run_ticket(&env, &ticket, &idle_shutdown())
        .await
        .unwrap();
    assert_eq!(result.outcome, RunOutcome::Success);

    let outcomes: Vec<String> =
        sqlx::query_scalar("SELECT outcome FROM job_runs ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(outcomes, vec!["skipped".to_string(), "success".to_string()]);
}

/// A successful run records its stats and leaves no lease behind.
#[tokio::test]
async fn run_records_stats_and_releases_lease() {
    let tmp = TempDir::new().unwrap();
    write_zone(tmp.path(), "net", "20250331", &["alpha.net.", "beta.net."]);
    write_zone(tmp.path(), "net", "20250401", &["alpha.net."]);
    let (config, pool) = setup(tmp.path()).await;

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let date = day(2025, 4, 1);
    let ticket = Ticket::ad_hoc("net", JobKind::Full, date, &config);
    let result = scheduler::run_ticket(&env, &ticket, &idle_shutdown())
        .await
        .unwrap();
    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.stats.drops_detected, 1);
    assert_eq!(result.stats.drops_inserted, 1);

    let row = sqlx::query("SELECT outcome, stats_json, finished_at FROM job_runs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("outcome"), "success");
    let stats: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("stats_json")).unwrap();
    assert_eq!(stats["drops_inserted"], 1);
    assert!(row.get::<Option<i64>, _>("finished_at").is_some());

    // Lease released on the terminal transition: a re-run acquires it.
    assert!(scheduler::acquire_lease(&pool, "net", date, JobKind::Full)
        .await
        .unwrap());
}

/// Re-running a completed cycle is a no-op in the database.
#[tokio::test]
async fn replayed_cycle_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    write_zone(tmp.path(), "net", "20250331", &["alpha.net.", "beta.net."]);
    write_zone(tmp.path(), "net", "20250401", &["alpha.net."]);
    let (config, pool) = setup(tmp.path()).await;

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let date = day(2025, 4, 1);

    let full = Ticket::ad_hoc("net", JobKind::Full, date, &config);
    scheduler::run_ticket(&env, &full, &idle_shutdown())
        .await
        .unwrap();

    let replay = Ticket::ad_hoc("net", JobKind::Detect, date, &config);
    let result = scheduler::run_ticket(&env, &replay, &idle_shutdown())
        .await
        .unwrap();
    assert_eq!(result.stats.drops_inserted, 0);
    assert_eq!(result.stats.drops_skipped, 1);

    let drops: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drops")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(drops, 1);

    let count: i64 = sqlx::query_scalar("SELECT last_drop_count FROM tlds WHERE name = 'net'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

async fn insert_watchlist(
    pool: &sqlx::SqlitePool,
    user_id: i64,
    pattern_kind: &str,
    pattern: &str,
    min_length: Option<i64>,
    allowed_tlds: Option<&str>,
) -> i64 {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO watchlists (user_id, is_active, pattern_kind, pattern, min_length,
                                allowed_tlds, created_at, updated_at)
        VALUES (?, 1, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(pattern_kind)
    .bind(pattern)
    .bind(min_length)
    .bind(allowed_tlds)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();
    result.last_insert_rowid()
}

/// S6: a glob watchlist with TLD and length filters matches `alpha` and
/// rejects `al`; the match lands in `watchlist_matches` and enqueues a
/// notification.
#[tokio::test]
async fn watchlist_match_fans_out() {
    let tmp = TempDir::new().unwrap();
    write_zone(
        tmp.path(),
        "dev",
        "20250101",
        &["alpha.dev.", "al.dev.", "keep.dev."],
    );
    write_zone(tmp.path(), "dev", "20250102", &["keep.dev."]);
    let (config, pool) = setup(tmp.path()).await;
    pool_add_tld(&pool, "dev").await;

    let watchlist_id = insert_watchlist(&pool, 7, "glob", "a*", Some(3), Some("dev")).await;

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let ticket = Ticket::ad_hoc("dev", JobKind::Full, day(2025, 1, 2), &config);
    let result = scheduler::run_ticket(&env, &ticket, &idle_shutdown())
        .await
        .unwrap();

    // Both alpha and al dropped, but only alpha passes the length filter.
    assert_eq!(result.stats.drops_inserted, 2);
    assert_eq!(result.stats.watchlist_matches, 1);

    let matched_drop: i64 = sqlx::query_scalar(
        "SELECT d.id FROM drops d JOIN watchlist_matches m ON m.drop_id = d.id
         WHERE m.watchlist_id = ? AND d.label = 'alpha'",
    )
    .bind(watchlist_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(matched_drop > 0);

    let notification = sqlx::query(
        "SELECT user_id, payload_json, status FROM notifications WHERE watchlist_id = ?",
    )
    .bind(watchlist_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(notification.get::<i64, _>("user_id"), 7);
    assert_eq!(notification.get::<String, _>("status"), "queued");
    let payload: serde_json::Value =
        serde_json::from_str(&notification.get::<String, _>("payload_json")).unwrap();
    assert_eq!(payload["drop"]["domain"], "alpha.dev");
}

/// Replaying a matched cycle does not duplicate matches or notifications.
#[tokio::test]
async fn watchlist_matches_are_deduplicated() {
    let tmp = TempDir::new().unwrap();
    write_zone(tmp.path(), "dev", "20250101", &["alpha.dev.", "keep.dev."]);
    write_zone(tmp.path(), "dev", "20250102", &["keep.dev."]);
    let (config, pool) = setup(tmp.path()).await;
    pool_add_tld(&pool, "dev").await;

    insert_watchlist(&pool, 7, "glob", "a*", None, None).await;

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let date = day(2025, 1, 2);
    scheduler::run_ticket(
        &env,
        &Ticket::ad_hoc("dev", JobKind::Full, date, &config),
        &idle_shutdown(),
    )
    .await
    .unwrap();
    scheduler::run_ticket(
        &env,
        &Ticket::ad_hoc("dev", JobKind::Detect, date, &config),
        &idle_shutdown(),
    )
    .await
    .unwrap();

    let matches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watchlist_matches")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(matches, 1);
    let notifications: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(notifications, 1);
}

/// An uncompilable pattern deactivates its watchlist with a reason instead
/// of failing the cycle.
#[tokio::test]
async fn invalid_pattern_deactivates_watchlist() {
    let tmp = TempDir::new().unwrap();
    let (_config, pool) = setup(tmp.path()).await;

    let id = insert_watchlist(&pool, 1, "regex", "a(b", None, None).await;
    let index = watchlist::load_active(&pool).await.unwrap();
    assert!(index.is_empty());

    let row = sqlx::query("SELECT is_active, disabled_reason FROM watchlists WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("is_active"), 0);
    assert!(row
        .get::<String, _>("disabled_reason")
        .contains("invalid pattern"));
}

/// A corrupt snapshot fails the cycle and is quarantined with a `.bad`
/// suffix so the next cycle re-downloads it.
#[tokio::test]
async fn corrupt_snapshot_is_quarantined() {
    let tmp = TempDir::new().unwrap();
    write_zone(tmp.path(), "net", "20250331", &["alpha.net."]);
    let dir = tmp.path().join("data").join("zones").join("net");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("20250401.zone"),
        "$GENERATE 1-10 host$ A 192.0.2.$\n",
    )
    .unwrap();
    let (config, pool) = setup(tmp.path()).await;

    let env = RunnerEnv::new(config.clone(), pool.clone()).unwrap();
    let ticket = Ticket::ad_hoc("net", JobKind::Detect, day(2025, 4, 1), &config);
    let err = scheduler::run_ticket(&env, &ticket, &idle_shutdown()).await;
    assert!(err.is_err());

    assert!(dir.join("20250401.zone.bad").exists());
    assert!(!dir.join("20250401.zone").exists());

    let row = sqlx::query("SELECT outcome, error_class FROM job_runs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("outcome"), "failed");
    assert_eq!(row.get::<String, _>("error_class"), "parser");
}
