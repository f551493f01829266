//! # zonedrop CLI
//!
//! The `zonedrop` binary drives the drop-tracking pipeline: database
//! initialization, manual and scheduled ingestion cycles, replay,
//! drop listings, TLD/job administration, and the JSON API server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `zonedrop init` | Create the SQLite database and run schema migrations |
//! | `zonedrop ingest --tld T [--date D]` | Run one full cycle synchronously |
//! | `zonedrop catch-up [--horizon N]` | Run cycles missed since the last success |
//! | `zonedrop replay --tld T --date D` | Re-run detection from existing snapshots |
//! | `zonedrop run` | Start the cron scheduler and worker pool |
//! | `zonedrop drops` | List persisted drops with filters |
//! | `zonedrop tld add\|list\|enable\|disable` | Manage tracked TLDs |
//! | `zonedrop job add\|list\|enable\|disable` | Manage scheduled jobs |
//! | `zonedrop serve` | Start the JSON API server |
//!
//! ## Exit codes
//!
//! `0` success · `1` generic error · `2` fatal config/auth error ·
//! `3` no baseline snapshot (informational)

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use zonedrop::config::{self, Config};
use zonedrop::error::CycleError;
use zonedrop::models::{CharsetType, JobKind, RunOutcome};
use zonedrop::progress::ProgressMode;
use zonedrop::query::DropFilter;
use zonedrop::scheduler::{self, RunnerEnv, Ticket};
use zonedrop::{admin, db, migrate, query, server};

/// zonedrop — daily dropped-domain tracking over ICANN CZDS zone files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/zonedrop.example.toml` for a full example; deployment
/// secrets can be supplied via environment variables instead.
#[derive(Parser)]
#[command(
    name = "zonedrop",
    about = "Track second-level domains dropping out of TLD zones day over day",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/zonedrop.toml")]
    config: PathBuf,

    /// Progress reporting on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// multiple times is safe.
    Init,

    /// Run one full ingestion cycle synchronously.
    ///
    /// Downloads the TLD's zone file (unless today's snapshot already
    /// exists), parses it, diffs against yesterday, persists drops, and
    /// evaluates watchlists.
    Ingest {
        /// TLD to ingest (e.g. `dev`).
        #[arg(long)]
        tld: String,

        /// Target date (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long)]
        date: Option<String>,
    },

    /// Run cycles missed since each job's last success, oldest first.
    CatchUp {
        /// Catch-up horizon in days. Defaults to the configured value.
        #[arg(long)]
        horizon: Option<u32>,
    },

    /// Re-run detection from existing snapshots (no download).
    Replay {
        /// TLD to replay.
        #[arg(long)]
        tld: String,

        /// Target date (YYYY-MM-DD).
        #[arg(long)]
        date: String,
    },

    /// Start the cron scheduler and worker pool (daemon).
    Run,

    /// List persisted drops.
    ///
    /// With no date filter the latest day in the database is shown.
    Drops {
        /// Filter by TLD.
        #[arg(long)]
        tld: Option<String>,

        /// Filter by drop date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,

        /// Minimum label length.
        #[arg(long)]
        min_length: Option<i64>,

        /// Maximum label length.
        #[arg(long)]
        max_length: Option<i64>,

        /// Charset class: letters, numbers, mixed, hyphenated, idn.
        #[arg(long)]
        charset: Option<String>,

        /// Substring to search for in labels.
        #[arg(long)]
        search: Option<String>,

        /// Minimum quality score.
        #[arg(long)]
        min_quality: Option<i64>,

        /// Page number.
        #[arg(long, default_value_t = 1)]
        page: i64,

        /// Page size (max 200).
        #[arg(long, default_value_t = 50)]
        page_size: i64,
    },

    /// Manage tracked TLDs.
    Tld {
        #[command(subcommand)]
        action: TldAction,
    },

    /// Manage scheduled jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Start the JSON API server.
    Serve,
}

#[derive(Subcommand)]
enum TldAction {
    /// Track a TLD (idempotent).
    Add {
        /// TLD name (e.g. `dev`).
        name: String,
        /// Human-readable display name.
        #[arg(long)]
        display_name: Option<String>,
    },
    /// List tracked TLDs with their last-import markers.
    List,
    /// Enable a TLD for scheduling.
    Enable { name: String },
    /// Disable a TLD; running cycles finish, new ones are refused.
    Disable { name: String },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create or update the job for a TLD (idempotent).
    Add {
        /// TLD the job ingests.
        tld: String,
        /// Job kind: ingest, parse, detect, or full.
        #[arg(long, default_value = "full")]
        kind: String,
        /// Cron schedule (seconds-first, e.g. `0 0 2 * * *`).
        #[arg(long)]
        schedule: Option<String>,
        /// Hard wall-clock timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<i64>,
        /// Transient-failure retry budget.
        #[arg(long)]
        max_retries: Option<i64>,
        /// First retry delay in seconds.
        #[arg(long)]
        backoff_secs: Option<i64>,
    },
    /// List jobs.
    List,
    /// Enable a job.
    Enable {
        tld: String,
        #[arg(long, default_value = "full")]
        kind: String,
    },
    /// Disable a job; takes effect on the next scheduler tick.
    Disable {
        tld: String,
        #[arg(long, default_value = "full")]
        kind: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<CycleError>()
                .map(CycleError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = config::load_config(&cli.config)
        .map_err(|e| anyhow::Error::new(CycleError::Config(format!("{:#}", e))))?;
    let progress = parse_progress(&cli.progress)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized successfully.");
            Ok(0)
        }

        Commands::Ingest { tld, date } => {
            let date = parse_date_or_today(date.as_deref())?;
            run_one_cycle(&config, &tld, JobKind::Full, date, progress).await
        }

        Commands::Replay { tld, date } => {
            let date = parse_date(&date)?;
            run_one_cycle(&config, &tld, JobKind::Detect, date, progress).await
        }

        Commands::CatchUp { horizon } => {
            let pool = db::connect(&config).await?;
            let horizon = horizon.unwrap_or(config.scheduler.catchup_horizon_days);
            let today = Utc::now().date_naive();
            let tickets = scheduler::catch_up_tickets(&pool, horizon, today).await?;

            if tickets.is_empty() {
                println!("catch-up: nothing to do");
                return Ok(0);
            }
            println!("catch-up: {} cycle(s) to run", tickets.len());

            let mut env = RunnerEnv::new(config.clone(), pool)
                .map_err(anyhow::Error::new)?;
            env.progress = progress;
            let shutdown = shutdown_channel();

            let mut failed = 0usize;
            for ticket in &tickets {
                match scheduler::run_ticket(&env, ticket, &shutdown).await {
                    Ok(result) => print_cycle_summary(ticket, &result),
                    Err(err) => {
                        eprintln!(
                            "catch-up {} {}: {:#}",
                            ticket.tld, ticket.target_date, err
                        );
                        failed += 1;
                    }
                }
            }

            if failed > 0 {
                println!("catch-up finished with {} failure(s)", failed);
                Ok(1)
            } else {
                println!("ok");
                Ok(0)
            }
        }

        Commands::Run => {
            let pool = db::connect(&config).await?;
            scheduler::run_daemon(config, pool).await?;
            Ok(0)
        }

        Commands::Drops {
            tld,
            date,
            min_length,
            max_length,
            charset,
            search,
            min_quality,
            page,
            page_size,
        } => {
            let pool = db::connect(&config).await?;
            let filter = DropFilter {
                tld,
                date: date.as_deref().map(parse_date).transpose()?,
                date_from: None,
                date_to: None,
                min_length,
                max_length,
                charset: charset
                    .as_deref()
                    .map(CharsetType::from_str)
                    .transpose()
                    .map_err(|e| anyhow::anyhow!(e))?,
                substring: search,
                min_quality,
                page,
                page_size,
            };
            let result = query::query_drops(&pool, &filter).await?;

            if result.results.is_empty() {
                println!("No drops.");
                return Ok(0);
            }
            println!(
                "{} drop(s), page {} (showing {})",
                result.total,
                result.page,
                result.results.len()
            );
            for drop in &result.results {
                let score = drop
                    .quality_score
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {}  {}  len={} charset={} score={}",
                    drop.drop_date,
                    drop.domain(),
                    drop.length,
                    drop.charset_type,
                    score
                );
            }
            Ok(0)
        }

        Commands::Tld { action } => {
            let pool = db::connect(&config).await?;
            match action {
                TldAction::Add { name, display_name } => {
                    let tld = admin::upsert_tld(&pool, &name, display_name.as_deref()).await?;
                    println!("tracking TLD '{}'", tld.name);
                }
                TldAction::List => {
                    let tlds = admin::list_tlds(&pool).await?;
                    if tlds.is_empty() {
                        println!("No TLDs tracked.");
                    }
                    for tld in tlds {
                        let last = tld
                            .last_import_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "never".to_string());
                        let state = if tld.is_active { "active" } else { "disabled" };
                        println!(
                            "  {}  {}  last import: {}  last drops: {}",
                            tld.name, state, last, tld.last_drop_count
                        );
                    }
                }
                TldAction::Enable { name } => {
                    admin::set_tld_active(&pool, &name, true).await?;
                    println!("enabled '{}'", name);
                }
                TldAction::Disable { name } => {
                    admin::set_tld_active(&pool, &name, false).await?;
                    println!("disabled '{}'", name);
                }
            }
            Ok(0)
        }

        Commands::Job { action } => {
            let pool = db::connect(&config).await?;
            match action {
                JobAction::Add {
                    tld,
                    kind,
                    schedule,
                    timeout_secs,
                    max_retries,
                    backoff_secs,
                } => {
                    let kind = JobKind::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?;
                    let job = admin::upsert_job(
                        &pool,
                        &tld,
                        kind,
                        &admin::JobSpec {
                            schedule,
                            timeout_secs,
                            max_retries,
                            backoff_base_secs: backoff_secs,
                        },
                    )
                    .await?;
                    println!("job {} {} scheduled '{}'", job.tld, job.kind, job.schedule);
                }
                JobAction::List => {
                    let jobs = admin::list_jobs(&pool).await?;
                    if jobs.is_empty() {
                        println!("No jobs.");
                    }
                    for job in jobs {
                        let state = if job.is_enabled { "enabled" } else { "disabled" };
                        println!(
                            "  {} {}  '{}'  {}  timeout={}s retries={}",
                            job.tld, job.kind, job.schedule, state, job.timeout_secs, job.max_retries
                        );
                    }
                }
                JobAction::Enable { tld, kind } => {
                    let kind = JobKind::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?;
                    admin::set_job_enabled(&pool, &tld, kind, true).await?;
                    println!("enabled {} {}", tld, kind);
                }
                JobAction::Disable { tld, kind } => {
                    let kind = JobKind::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?;
                    admin::set_job_enabled(&pool, &tld, kind, false).await?;
                    println!("disabled {} {}", tld, kind);
                }
            }
            Ok(0)
        }

        Commands::Serve => {
            server::run_server(&config).await?;
            Ok(0)
        }
    }
}

/// Run one cycle for the CLI: lease, execute, print, map exit code.
async fn run_one_cycle(
    config: &Config,
    tld: &str,
    kind: JobKind,
    date: NaiveDate,
    progress: ProgressMode,
) -> Result<i32> {
    let pool = db::connect(config).await?;
    let mut env = RunnerEnv::new(config.clone(), pool).map_err(anyhow::Error::new)?;
    env.progress = progress;

    let ticket = Ticket::ad_hoc(tld, kind, date, config);
    let shutdown = shutdown_channel();

    let result = scheduler::run_ticket(&env, &ticket, &shutdown)
        .await
        .map_err(anyhow::Error::new)?;

    print_cycle_summary(&ticket, &result);

    if result.no_baseline {
        // Informational outcome with its own exit code, not a failure.
        let note = CycleError::MissingBaseline {
            tld: ticket.tld.clone(),
            date: ticket.target_date,
        };
        eprintln!("note: {}", note);
        return Ok(note.exit_code());
    }
    match result.outcome {
        RunOutcome::Success => Ok(0),
        RunOutcome::Skipped => Ok(0),
        _ => Ok(1),
    }
}

fn print_cycle_summary(ticket: &Ticket, result: &scheduler::TicketResult) {
    println!("{} {} {}", ticket.kind, ticket.tld, ticket.target_date);
    if result.outcome == RunOutcome::Skipped {
        println!("  skipped: another run holds the lease");
        return;
    }
    if result.no_baseline {
        println!("  no baseline snapshot; no drops recorded");
    }
    let stats = &result.stats;
    if stats.bytes_downloaded > 0 {
        println!("  bytes downloaded: {}", stats.bytes_downloaded);
    }
    println!("  labels parsed: {}", stats.labels_parsed);
    println!("  drops detected: {}", stats.drops_detected);
    println!(
        "  drops inserted: {} (skipped {})",
        stats.drops_inserted, stats.drops_skipped
    );
    println!("  watchlist matches: {}", stats.watchlist_matches);
    println!("ok");
}

/// Ctrl-c flips the shutdown channel; runs observe it at every suspension
/// point.
fn shutdown_channel() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

fn parse_progress(value: &str) -> Result<ProgressMode> {
    match value {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(anyhow::anyhow!(
            "invalid progress mode '{}': expected auto, off, human, or json",
            other
        )),
    }
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("invalid date '{}': expected YYYY-MM-DD", value))
}

fn parse_date_or_today(value: Option<&str>) -> Result<NaiveDate> {
    match value {
        Some(v) => parse_date(v),
        None => Ok(Utc::now().date_naive()),
    }
}
