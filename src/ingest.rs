//! Per-`(tld, date)` ingestion cycle orchestration.
//!
//! Coordinates the full pipeline for one TLD and one day, strictly in
//! order: fetch (unless the snapshot exists) → parse both days → detect →
//! persist → watchlist match → update TLD markers → prune old snapshots.
//!
//! The single-flight lease is the caller's job (the scheduler and CLI both
//! acquire it before calling in). Every stage observes the cancel channel;
//! ZoneStore commits are atomic and drop persistence is idempotent, so a
//! cycle interrupted anywhere can simply be re-run.

use anyhow::anyhow;
use chrono::{Days, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;

use crate::config::Config;
use crate::czds::CzdsClient;
use crate::detect;
use crate::error::CycleError;
use crate::models::{compact_date, CycleOutcome, CycleStats, JobKind};
use crate::parser::{self, ParseOptions};
use crate::persist;
use crate::progress::{CycleEvent, CycleProgress};
use crate::quality::QualityScorer;
use crate::store::ZoneStore;
use crate::watchlist;

/// Everything a cycle needs, owned by the caller.
pub struct CycleContext<'a> {
    pub config: &'a Config,
    pub pool: &'a SqlitePool,
    pub store: &'a ZoneStore,
    pub czds: &'a CzdsClient,
    pub scorer: Option<&'a dyn QualityScorer>,
    pub progress: &'a dyn CycleProgress,
}

/// Run one cycle. `kind` selects how much of the pipeline runs:
///
/// - [`JobKind::Ingest`] — download and commit today's snapshot, then stop.
/// - [`JobKind::Parse`] — parse an existing snapshot (sanity/warm-up), no
///   drops recorded.
/// - [`JobKind::Detect`] — replay: detect from existing snapshots, no
///   download.
/// - [`JobKind::Full`] — the whole pipeline.
pub async fn run_cycle(
    ctx: &CycleContext<'_>,
    tld: &str,
    date: NaiveDate,
    kind: JobKind,
    cancel: &watch::Receiver<bool>,
) -> Result<(CycleOutcome, CycleStats), CycleError> {
    let tld = tld.to_ascii_lowercase();
    let mut stats = CycleStats::default();

    require_tracked_tld(ctx.pool, &tld).await?;

    // Fetch today's snapshot unless it is already committed.
    if matches!(kind, JobKind::Ingest | JobKind::Full) && !ctx.store.exists(&tld, date) {
        fetch_snapshot(ctx, &tld, date, cancel, &mut stats).await?;
    }
    if kind == JobKind::Ingest {
        return Ok((CycleOutcome::Completed, stats));
    }

    if !ctx.store.exists(&tld, date) {
        return Err(CycleError::Fatal(anyhow!(
            "no snapshot for {}/{} (run ingest first)",
            tld,
            compact_date(date)
        )));
    }

    let today_labels = parse_day(ctx, &tld, date, cancel).await?;
    stats.labels_parsed = today_labels.len();

    if kind == JobKind::Parse {
        return Ok((CycleOutcome::Completed, stats));
    }

    // The baseline is the adjacent previous day: a drop on day d is defined
    // against day d-1, never an older snapshot.
    let baseline_date = date
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| CycleError::Fatal(anyhow!("date underflow")))?;
    if !ctx.store.exists(&tld, baseline_date) {
        persist::update_tld_markers(ctx.pool, &tld, date, 0).await?;
        return Ok((CycleOutcome::NoBaseline, stats));
    }

    let prev_labels = parse_day(ctx, &tld, baseline_date, cancel).await?;

    check_cancel(cancel)?;

    // The diff walks files; run it off the async runtime. Metadata
    // derivation stays here so the scorer borrow never crosses the task.
    let dropped = {
        let spill = spill_dir(ctx.config);
        let handle = tokio::task::spawn_blocking(move || {
            detect::diff_labels(prev_labels, today_labels, &spill)
        });
        handle
            .await
            .map_err(|e| CycleError::Fatal(anyhow!("detector task failed: {}", e)))??
    };
    let drops = detect::derive_drops(dropped, &tld, date, ctx.scorer);
    stats.drops_detected = drops.len() as u64;

    check_cancel(cancel)?;

    let outcome = persist::persist_drops(ctx.pool, &drops, persist::DEFAULT_BATCH_SIZE).await?;
    stats.drops_inserted = outcome.inserted;
    stats.drops_skipped = outcome.skipped;

    check_cancel(cancel)?;

    let index = watchlist::load_active(ctx.pool)
        .await
        .map_err(CycleError::Transient)?;
    let matches = watchlist::match_drops(ctx.pool, &index, &outcome.inserted_drops)
        .await
        .map_err(CycleError::Transient)?;
    stats.watchlist_matches = matches.len() as u64;

    // `last_drop_count` reflects the day's detected drops, so an idempotent
    // replay (all rows skipped) leaves it unchanged.
    persist::update_tld_markers(ctx.pool, &tld, date, outcome.inserted + outcome.skipped).await?;

    // Retention: drop snapshots older than the configured window.
    ctx.store
        .prune(&tld, ctx.config.storage.keep_snapshots)
        .map_err(CycleError::Fatal)?;

    Ok((CycleOutcome::Completed, stats))
}

/// Download, verify, and commit today's snapshot, then register it.
async fn fetch_snapshot(
    ctx: &CycleContext<'_>,
    tld: &str,
    date: NaiveDate,
    cancel: &watch::Receiver<bool>,
    stats: &mut CycleStats,
) -> Result<(), CycleError> {
    let url = ctx.czds.zone_url(tld).await?;
    let head = ctx.czds.head_zone(&url).await?;

    let handle = ctx
        .store
        .reserve(tld, date)
        .map_err(CycleError::Fatal)?;

    let tld_owned = tld.to_string();
    let total = head.size;
    let report = move |bytes: u64| {
        ctx.progress.report(CycleEvent::Downloading {
            tld: tld_owned.clone(),
            bytes,
            total,
        });
    };
    let (handle, download) = ctx
        .czds
        .download_zone(&url, &head, handle, cancel, Some(&report))
        .await?;
    stats.bytes_downloaded = download.bytes_downloaded;

    let snapshot = handle
        .commit(head.size, Utc::now().timestamp())
        .map_err(CycleError::Transient)?;
    persist::record_snapshot(ctx.pool, &snapshot).await?;

    Ok(())
}

/// Parse one day's snapshot off the async runtime. A structurally corrupt
/// snapshot is quarantined before the error propagates.
async fn parse_day(
    ctx: &CycleContext<'_>,
    tld: &str,
    date: NaiveDate,
    cancel: &watch::Receiver<bool>,
) -> Result<parser::LabelSet, CycleError> {
    let reader = ctx.store.open(tld, date).map_err(CycleError::Fatal)?;
    let opts = ParseOptions {
        label_budget: ctx.config.parser.label_budget,
        checkpoint_lines: ctx.config.parser.checkpoint_lines,
        spill_dir: spill_dir(ctx.config),
    };
    let tld_owned = tld.to_string();
    let cancel_rx = cancel.clone();

    let result = tokio::task::spawn_blocking(move || {
        parser::parse_zone(reader, &tld_owned, &opts, Some(&cancel_rx))
    })
    .await
    .map_err(|e| CycleError::Fatal(anyhow!("parser task failed: {}", e)))?;

    match result {
        Ok(outcome) => {
            ctx.progress.report(CycleEvent::Parsing {
                tld: tld.to_string(),
                lines: outcome.lines_read,
            });
            Ok(outcome.labels)
        }
        Err(err @ CycleError::Parser(_)) => {
            let _ = ctx.store.quarantine(tld, date);
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn require_tracked_tld(pool: &SqlitePool, tld: &str) -> Result<(), CycleError> {
    let row = sqlx::query("SELECT is_active FROM tlds WHERE name = ?")
        .bind(tld)
        .fetch_optional(pool)
        .await
        .map_err(CycleError::from_sqlx)?;

    match row {
        None => Err(CycleError::Fatal(anyhow!(
            "TLD '{}' is not tracked (add it with `zonedrop tld add {}`)",
            tld,
            tld
        ))),
        Some(row) => {
            let active: i64 = row.get("is_active");
            if active == 0 {
                Err(CycleError::Fatal(anyhow!("TLD '{}' is disabled", tld)))
            } else {
                Ok(())
            }
        }
    }
}

fn spill_dir(config: &Config) -> std::path::PathBuf {
    config.storage.data_dir.join("tmp")
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), CycleError> {
    if *cancel.borrow() {
        Err(CycleError::Cancelled)
    } else {
        Ok(())
    }
}
