//! Pipeline error taxonomy.
//!
//! The job runner decides retry behavior from the error *kind*, not its
//! message: only [`CycleError::Transient`] is retried. Fatal, parser, and
//! cancellation errors go straight to the JobRun record; `MissingBaseline`
//! is an informational outcome, not a failure. Command-level code stays on
//! `anyhow::Result` and downcasts at the exit boundary.

use chrono::NaiveDate;
use thiserror::Error;

/// Classified failure of an ingestion cycle or one of its stages.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Missing credentials, bad cron expression, unwritable data directory.
    /// Surfaced at startup; the process exits with code 2.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network reset, 5xx, temporary disk or DB trouble. Retried with
    /// backoff by the runner.
    #[error("transient error: {0:#}")]
    Transient(anyhow::Error),

    /// Auth rejection, 4xx, permission denied. Recorded, never retried.
    #[error("fatal error: {0:#}")]
    Fatal(anyhow::Error),

    /// Structural corruption in a fully-downloaded zone file. The snapshot
    /// is quarantined and the cycle ends failed.
    #[error("zone parse error: {0}")]
    Parser(String),

    /// No snapshot exists for the day before `date`. Cycle ends success
    /// with zero drops.
    #[error("no baseline snapshot for {tld} before {date}")]
    MissingBaseline { tld: String, date: NaiveDate },

    /// The runner's cancel signal was observed.
    #[error("cycle cancelled")]
    Cancelled,

    /// The run exceeded its wall-clock timeout.
    #[error("cycle timed out")]
    TimedOut,
}

impl CycleError {
    /// Whether the runner should retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CycleError::Transient(_))
    }

    /// Stable class label recorded on JobRuns and in the structured log.
    pub fn class(&self) -> &'static str {
        match self {
            CycleError::Config(_) => "config",
            CycleError::Transient(_) => "transient_io",
            CycleError::Fatal(_) => "fatal_io",
            CycleError::Parser(_) => "parser",
            CycleError::MissingBaseline { .. } => "missing_baseline",
            CycleError::Cancelled => "cancelled",
            CycleError::TimedOut => "timeout",
        }
    }

    /// Process exit code when the error reaches the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            CycleError::Config(_) => 2,
            CycleError::MissingBaseline { .. } => 3,
            CycleError::Fatal(e) if is_auth_message(&e.to_string()) => 2,
            _ => 1,
        }
    }

    /// Wrap an I/O error, classifying disk-full and interrupted writes as
    /// transient and everything else (permissions, missing paths) as fatal.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::StorageFull => CycleError::Transient(err.into()),
            _ => CycleError::Fatal(err.into()),
        }
    }

    /// Classify an HTTP status per the CZDS failure policy: 5xx, 408 and
    /// 429 retry; other 4xx are fatal.
    pub fn from_http_status(status: reqwest::StatusCode, context: String) -> Self {
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            CycleError::Transient(anyhow::anyhow!("{} (HTTP {})", context, status))
        } else {
            CycleError::Fatal(anyhow::anyhow!("{} (HTTP {})", context, status))
        }
    }

    /// Wrap a sqlx error. Busy/locked databases retry; constraint and
    /// schema errors are fatal.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => CycleError::Transient(err.into()),
            sqlx::Error::Database(db) if db.message().contains("locked") => {
                CycleError::Transient(err.into())
            }
            _ => CycleError::Fatal(err.into()),
        }
    }
}

fn is_auth_message(msg: &str) -> bool {
    msg.contains("HTTP 401") || msg.contains("HTTP 403") || msg.contains("credentials")
}
