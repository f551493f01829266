//! Cron scheduling, worker pool, single-flight leases, and job runs.
//!
//! The dispatcher is the only ticket producer: cron fires (via
//! `tokio-cron-scheduler`) and startup catch-up both enqueue
//! `(job, target_date)` tickets into a bounded queue consumed by `W`
//! workers. Execution of one ticket:
//!
//! 1. Acquire the `(tld, target_date, kind)` lease — one atomic INSERT on
//!    the primary key. A held lease records a `skipped` run and stops.
//! 2. Insert a `running` JobRun row.
//! 3. Run the cycle under the hard wall-clock timeout, retrying transient
//!    failures with exponential backoff (base 30 s, cap 1 h, jitter) up to
//!    `max_retries`.
//! 4. On timeout or shutdown, signal the cycle's cancel channel and give it
//!    a bounded grace window to unwind.
//! 5. Release the lease and finalize the JobRun with outcome and stats.
//!
//! Every run emits one structured `tracing` record with the cycle counters.
//!
//! Leases are cleared wholesale at scheduler startup: deployment is
//! single-node, so a surviving lease can only be a crash leftover.

use anyhow::{anyhow, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::czds::{backoff_delay, with_jitter, CzdsClient};
use crate::error::CycleError;
use crate::ingest::{run_cycle, CycleContext};
use crate::models::{CycleOutcome, CycleStats, Job, JobKind, RunOutcome};
use crate::progress::ProgressMode;
use crate::quality;
use crate::store::ZoneStore;

/// How long a cancelled or timed-out cycle gets to unwind.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Retry backoff cap for job-level retries.
const RETRY_BACKOFF_CAP_SECS: u64 = 3600;

/// One unit of work: run `kind` for `(tld, target_date)`.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub job_id: Option<i64>,
    pub tld: String,
    pub kind: JobKind,
    pub target_date: NaiveDate,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
}

impl Ticket {
    /// A ticket outside any stored job (CLI `ingest`/`replay`).
    pub fn ad_hoc(tld: &str, kind: JobKind, target_date: NaiveDate, config: &Config) -> Self {
        Self {
            job_id: None,
            tld: tld.to_ascii_lowercase(),
            kind,
            target_date,
            timeout_secs: config.scheduler.cycle_timeout_secs,
            max_retries: config.scheduler.max_retries,
            backoff_base_secs: config.scheduler.backoff_base_secs,
        }
    }

    fn for_job(job: &Job, target_date: NaiveDate) -> Self {
        Self {
            job_id: Some(job.id),
            tld: job.tld.clone(),
            kind: job.kind,
            target_date,
            timeout_secs: job.timeout_secs.max(1) as u64,
            max_retries: job.max_retries.max(0) as u32,
            backoff_base_secs: job.backoff_base_secs.max(1) as u64,
        }
    }
}

// ============ Leases (single-flight) ============

/// Try to acquire the `(tld, target_date, kind)` lease. Exactly one caller
/// wins; everyone else sees `false`.
pub async fn acquire_lease(
    pool: &SqlitePool,
    tld: &str,
    date: NaiveDate,
    kind: JobKind,
) -> Result<bool, CycleError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO leases (tld, target_date, kind, acquired_at) VALUES (?, ?, ?, ?)",
    )
    .bind(tld)
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(kind.as_str())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .map_err(CycleError::from_sqlx)?;

    Ok(result.rows_affected() == 1)
}

pub async fn release_lease(
    pool: &SqlitePool,
    tld: &str,
    date: NaiveDate,
    kind: JobKind,
) -> Result<(), CycleError> {
    sqlx::query("DELETE FROM leases WHERE tld = ? AND target_date = ? AND kind = ?")
        .bind(tld)
        .bind(date.format("%Y-%m-%d").to_string())
        .bind(kind.as_str())
        .execute(pool)
        .await
        .map_err(CycleError::from_sqlx)?;
    Ok(())
}

/// Remove crash leftovers. Called once at scheduler startup, before any
/// worker runs.
pub async fn clear_leases(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM leases").execute(pool).await?;
    Ok(())
}

// ============ JobRun recording ============

async fn insert_run(pool: &SqlitePool, ticket: &Ticket, outcome: &str) -> Result<i64, CycleError> {
    let result = sqlx::query(
        r#"
        INSERT INTO job_runs (job_id, tld, kind, target_date, started_at, outcome)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ticket.job_id)
    .bind(&ticket.tld)
    .bind(ticket.kind.as_str())
    .bind(ticket.target_date.format("%Y-%m-%d").to_string())
    .bind(Utc::now().timestamp())
    .bind(outcome)
    .execute(pool)
    .await
    .map_err(CycleError::from_sqlx)?;
    Ok(result.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
async fn finish_run(
    pool: &SqlitePool,
    run_id: i64,
    outcome: RunOutcome,
    stats: Option<&CycleStats>,
    no_baseline: bool,
    error_class: Option<&str>,
    error_message: Option<&str>,
    retry_count: u32,
) -> Result<(), CycleError> {
    let stats_json = stats.map(|s| {
        let mut value = serde_json::to_value(s).unwrap_or_default();
        if no_baseline {
            value["no_baseline"] = serde_json::Value::Bool(true);
        }
        value.to_string()
    });

    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = ?, outcome = ?, stats_json = ?, error_class = ?,
            error_message = ?, retry_count = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(outcome.as_str())
    .bind(stats_json)
    .bind(error_class)
    .bind(error_message)
    .bind(retry_count as i64)
    .bind(run_id)
    .execute(pool)
    .await
    .map_err(CycleError::from_sqlx)?;
    Ok(())
}

// ============ Ticket execution ============

/// Shared, read-only state for workers.
pub struct RunnerEnv {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: ZoneStore,
    pub czds: Arc<CzdsClient>,
    /// Off for the daemon; the CLI turns this on for interactive runs.
    pub progress: ProgressMode,
}

impl RunnerEnv {
    pub fn new(config: Config, pool: SqlitePool) -> Result<Self, CycleError> {
        let store = ZoneStore::new(&config.storage.data_dir);
        let czds = Arc::new(CzdsClient::new(config.czds.clone())?);
        Ok(Self {
            config,
            pool,
            store,
            czds,
            progress: ProgressMode::Off,
        })
    }
}

/// Terminal state of one executed ticket.
#[derive(Debug, Clone, Copy)]
pub struct TicketResult {
    pub outcome: RunOutcome,
    pub stats: CycleStats,
    /// The cycle succeeded without a prior-day snapshot to diff against.
    pub no_baseline: bool,
}

/// Execute one ticket end to end: lease, run with timeout and retries,
/// record, release. Returns the terminal outcome.
pub async fn run_ticket(
    env: &RunnerEnv,
    ticket: &Ticket,
    shutdown: &watch::Receiver<bool>,
) -> Result<TicketResult, CycleError> {
    if !acquire_lease(&env.pool, &ticket.tld, ticket.target_date, ticket.kind).await? {
        let run_id = insert_run(&env.pool, ticket, RunOutcome::Skipped.as_str()).await?;
        finish_run(
            &env.pool,
            run_id,
            RunOutcome::Skipped,
            None,
            false,
            None,
            Some("lease held by another run"),
            0,
        )
        .await?;
        log_run(ticket, RunOutcome::Skipped, &CycleStats::default(), 0, None);
        return Ok(TicketResult {
            outcome: RunOutcome::Skipped,
            stats: CycleStats::default(),
            no_baseline: false,
        });
    }

    let run_id = insert_run(&env.pool, ticket, "running").await?;
    let started = Instant::now();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let attempt_counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let result = {
        let attempts = attempt_counter.clone();
        let cycle_loop = run_with_retries(env, ticket, cancel_rx.clone(), attempts);
        tokio::pin!(cycle_loop);

        tokio::select! {
            res = &mut cycle_loop => res,
            _ = tokio::time::sleep(Duration::from_secs(ticket.timeout_secs)) => {
                let _ = cancel_tx.send(true);
                // Bounded grace for cleanup; the outcome is timed_out either way.
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut cycle_loop).await;
                Err(CycleError::TimedOut)
            }
            _ = watch_shutdown(shutdown) => {
                let _ = cancel_tx.send(true);
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut cycle_loop).await;
                Err(CycleError::Cancelled)
            }
        }
    };

    let retries = attempt_counter.load(std::sync::atomic::Ordering::Relaxed);
    let duration_ms = started.elapsed().as_millis() as u64;

    let no_baseline = matches!(&result, Ok((CycleOutcome::NoBaseline, _)));
    let (outcome, stats, error): (RunOutcome, CycleStats, Option<CycleError>) = match result {
        Ok((_, stats)) => (RunOutcome::Success, stats, None),
        Err(err @ CycleError::TimedOut) => (RunOutcome::TimedOut, CycleStats::default(), Some(err)),
        // Explicit cancellation (shutdown) records failed with its own class.
        Err(err @ CycleError::Cancelled) => (RunOutcome::Failed, CycleStats::default(), Some(err)),
        Err(err) => (RunOutcome::Failed, CycleStats::default(), Some(err)),
    };

    let error_message = error.as_ref().map(|e| e.to_string());
    finish_run(
        &env.pool,
        run_id,
        outcome,
        Some(&stats),
        no_baseline,
        error.as_ref().map(|e| e.class()),
        error_message.as_deref(),
        retries,
    )
    .await?;
    release_lease(&env.pool, &ticket.tld, ticket.target_date, ticket.kind).await?;

    log_run(ticket, outcome, &stats, duration_ms, error.as_ref());

    match error {
        Some(err) => Err(err),
        None => Ok(TicketResult {
            outcome,
            stats,
            no_baseline,
        }),
    }
}

/// The retry loop: transient failures back off and retry, everything else
/// surfaces immediately.
async fn run_with_retries(
    env: &RunnerEnv,
    ticket: &Ticket,
    cancel: watch::Receiver<bool>,
    attempts: Arc<std::sync::atomic::AtomicU32>,
) -> Result<(CycleOutcome, CycleStats), CycleError> {
    let scorer = quality::create_scorer(&env.config.quality);
    let ctx = CycleContext {
        config: &env.config,
        pool: &env.pool,
        store: &env.store,
        czds: &env.czds,
        scorer: scorer.as_deref(),
        progress: &env.progress,
    };

    let mut last_err: Option<CycleError> = None;
    for attempt in 0..=ticket.max_retries {
        if attempt > 0 {
            attempts.store(attempt, std::sync::atomic::Ordering::Relaxed);
            let delay = with_jitter(backoff_delay(
                attempt,
                ticket.backoff_base_secs,
                RETRY_BACKOFF_CAP_SECS,
            ));
            warn!(
                tld = %ticket.tld,
                target_date = %ticket.target_date,
                attempt,
                delay_secs = delay.as_secs(),
                "retrying after transient failure"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = watch_shutdown(&cancel) => return Err(CycleError::Cancelled),
            }
        }

        match run_cycle(&ctx, &ticket.tld, ticket.target_date, ticket.kind, &cancel).await {
            Ok(done) => return Ok(done),
            Err(err) if err.is_retryable() => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| CycleError::Transient(anyhow!("cycle failed after retries"))))
}

fn log_run(
    ticket: &Ticket,
    outcome: RunOutcome,
    stats: &CycleStats,
    duration_ms: u64,
    error: Option<&CycleError>,
) {
    match error {
        None => info!(
            tld = %ticket.tld,
            target_date = %ticket.target_date,
            kind = %ticket.kind,
            outcome = outcome.as_str(),
            duration_ms,
            bytes_downloaded = stats.bytes_downloaded,
            labels_parsed = stats.labels_parsed,
            drops_detected = stats.drops_detected,
            drops_inserted = stats.drops_inserted,
            "cycle finished"
        ),
        Some(err) => error!(
            tld = %ticket.tld,
            target_date = %ticket.target_date,
            kind = %ticket.kind,
            outcome = outcome.as_str(),
            duration_ms,
            error_class = err.class(),
            error = %err,
            "cycle finished"
        ),
    }
}

// ============ Catch-up ============

/// Tickets for daily cycles missed while the process was down: for each
/// enabled job, one ticket per date between its last success and today,
/// oldest first, bounded by the horizon.
pub async fn catch_up_tickets(
    pool: &SqlitePool,
    horizon_days: u32,
    today: NaiveDate,
) -> Result<Vec<Ticket>> {
    let jobs = load_enabled_jobs(pool).await?;
    let mut tickets = Vec::new();
    let horizon_start = today
        .checked_sub_days(Days::new(horizon_days.saturating_sub(1) as u64))
        .unwrap_or(today);

    for job in &jobs {
        let last_success = last_success_date(pool, &job.tld).await?;
        let mut date = match last_success {
            // First run ever: today only; there is no history to backfill.
            None => today,
            Some(last) => last
                .checked_add_days(Days::new(1))
                .unwrap_or(today)
                .max(horizon_start),
        };
        while date <= today {
            tickets.push(Ticket::for_job(job, date));
            date = match date.checked_add_days(Days::new(1)) {
                Some(next) => next,
                None => break,
            };
        }
    }

    tickets.sort_by(|a, b| a.target_date.cmp(&b.target_date).then(a.tld.cmp(&b.tld)));
    Ok(tickets)
}

/// Latest non-failed cycle date for a TLD, falling back to the TLD's
/// last-import marker for history that predates job logging.
async fn last_success_date(pool: &SqlitePool, tld: &str) -> Result<Option<NaiveDate>> {
    let from_runs: Option<String> = sqlx::query_scalar(
        r#"
        SELECT MAX(target_date) FROM job_runs
        WHERE tld = ? AND kind IN ('full', 'detect') AND outcome = 'success'
        "#,
    )
    .bind(tld)
    .fetch_one(pool)
    .await?;

    if let Some(date) = from_runs.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()) {
        return Ok(Some(date));
    }

    let from_tld: Option<String> =
        sqlx::query_scalar("SELECT last_import_date FROM tlds WHERE name = ?")
            .bind(tld)
            .fetch_optional(pool)
            .await?
            .flatten();

    Ok(from_tld.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
}

pub async fn load_enabled_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        SELECT id, tld, kind, schedule, is_enabled, timeout_secs, max_retries, backoff_base_secs
        FROM jobs
        WHERE is_enabled = 1
        ORDER BY tld
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let kind_str: String = row.get("kind");
        let kind = JobKind::from_str(&kind_str)
            .map_err(|e| anyhow!("job for '{}': {}", row.get::<String, _>("tld"), e))?;
        jobs.push(Job {
            id: row.get("id"),
            tld: row.get("tld"),
            kind,
            schedule: row.get("schedule"),
            is_enabled: true,
            timeout_secs: row.get("timeout_secs"),
            max_retries: row.get("max_retries"),
            backoff_base_secs: row.get("backoff_base_secs"),
        });
    }
    Ok(jobs)
}

// ============ Daemon ============

/// Run the cron dispatcher and worker pool until ctrl-c.
pub async fn run_daemon(config: Config, pool: SqlitePool) -> Result<()> {
    clear_leases(&pool).await?;

    let env = Arc::new(
        RunnerEnv::new(config.clone(), pool.clone())
            .map_err(|e| anyhow!("scheduler startup failed: {}", e))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ticket_tx, ticket_rx) = mpsc::channel::<Ticket>(1024);
    let ticket_rx = Arc::new(Mutex::new(ticket_rx));

    // Missed ticks first, oldest first, so baselines build in order.
    let today = Utc::now().date_naive();
    let missed = catch_up_tickets(&pool, config.scheduler.catchup_horizon_days, today).await?;
    if !missed.is_empty() {
        info!(tickets = missed.len(), "enqueueing catch-up cycles");
    }
    for ticket in missed {
        ticket_tx
            .send(ticket)
            .await
            .map_err(|_| anyhow!("ticket queue closed during catch-up"))?;
    }

    // Cron dispatcher: the only live producer.
    let mut cron = JobScheduler::new()
        .await
        .context("creating cron scheduler")?;
    for job in load_enabled_jobs(&pool).await? {
        let tx = ticket_tx.clone();
        let descriptor = job.clone();
        let cron_job = CronJob::new_async(job.schedule.as_str(), move |_id, _sched| {
            let tx = tx.clone();
            let descriptor = descriptor.clone();
            Box::pin(async move {
                let ticket = Ticket::for_job(&descriptor, Utc::now().date_naive());
                if tx.try_send(ticket).is_err() {
                    warn!(tld = %descriptor.tld, "ticket queue full, tick dropped");
                }
            })
        })
        .map_err(|e| {
            anyhow!(
                "invalid cron expression '{}' for TLD '{}': {}",
                job.schedule,
                job.tld,
                e
            )
        })?;
        cron.add(cron_job).await.context("adding cron job")?;
    }
    cron.start().await.context("starting cron scheduler")?;

    // Bounded worker pool.
    let mut workers = Vec::new();
    for worker_id in 0..config.scheduler.workers {
        let env = env.clone();
        let rx = ticket_rx.clone();
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(worker_id, env, rx, shutdown).await;
        }));
    }

    info!(
        workers = config.scheduler.workers,
        "scheduler running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    drop(ticket_tx);
    cron.shutdown().await.ok();
    for worker in workers {
        worker.await.ok();
    }

    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    env: Arc<RunnerEnv>,
    rx: Arc<Mutex<mpsc::Receiver<Ticket>>>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let ticket = {
            let mut guard = rx.lock().await;
            tokio::select! {
                ticket = guard.recv() => ticket,
                _ = watch_shutdown(&shutdown) => return,
            }
        };
        let Some(ticket) = ticket else { return };

        if let Err(err) = run_ticket(&env, &ticket, &shutdown).await {
            // Already recorded on the JobRun; workers keep going.
            error!(
                worker_id,
                tld = %ticket.tld,
                error_class = err.class(),
                "ticket failed"
            );
        }
    }
}

async fn watch_shutdown(shutdown: &watch::Receiver<bool>) {
    let mut rx = shutdown.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
