//! Core data models used throughout zonedrop.
//!
//! These types represent the entities that flow through the ingestion and
//! drop-detection pipeline. The data lifecycle is:
//!
//! ```text
//! CZDS → ZoneSnapshot → parse() → LabelSet ─┐
//!                                           ├─ detect() → DropRecord
//! ZoneSnapshot(previous day) → LabelSet ────┘        ↓
//!                                              persist() → drops table
//!                                                    ↓
//!                                              match() → WatchlistMatch
//! ```
//!
//! # Conventions
//!
//! Dates (`drop_date`, snapshot dates, job target dates) are civil dates
//! stored as `YYYY-MM-DD` TEXT columns; instants (`created_at`, `fetched_at`,
//! run timestamps) are Unix epoch seconds stored as INTEGER columns.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tracked top-level domain. The unit of scheduling.
///
/// Created by admin action (`zonedrop tld add`); `last_import_date` and
/// `last_drop_count` are updated by each successful ingestion cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Tld {
    pub id: i64,
    /// Lowercase ASCII label, unique (e.g. `"dev"`).
    pub name: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub last_import_date: Option<NaiveDate>,
    pub last_drop_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Metadata for one committed daily zone snapshot.
///
/// The filesystem layout under `<data_root>/zones/<tld>/` is canonical;
/// this row is the queryable registry entry written after a verified commit.
/// Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub tld: String,
    pub date: NaiveDate,
    pub path: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub fetched_at: i64,
}

/// Character-class of an SLD label.
///
/// An `xn--` label is always `Idn`, even though the encoded form contains
/// hyphens; the remaining classes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharsetType {
    Letters,
    Numbers,
    Mixed,
    Hyphenated,
    Idn,
}

impl CharsetType {
    /// Classify a lowercased SLD label in a single pass.
    pub fn classify(label: &str) -> Self {
        if label.starts_with("xn--") {
            return CharsetType::Idn;
        }
        let mut all_digits = true;
        let mut all_letters = true;
        let mut any_hyphen = false;
        for b in label.bytes() {
            match b {
                b'0'..=b'9' => all_letters = false,
                b'a'..=b'z' => all_digits = false,
                b'-' => {
                    any_hyphen = true;
                    all_digits = false;
                    all_letters = false;
                }
                _ => {
                    all_digits = false;
                    all_letters = false;
                }
            }
        }
        if !label.is_empty() && all_digits {
            CharsetType::Numbers
        } else if !label.is_empty() && all_letters {
            CharsetType::Letters
        } else if any_hyphen {
            CharsetType::Hyphenated
        } else {
            CharsetType::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CharsetType::Letters => "letters",
            CharsetType::Numbers => "numbers",
            CharsetType::Mixed => "mixed",
            CharsetType::Hyphenated => "hyphenated",
            CharsetType::Idn => "idn",
        }
    }
}

impl FromStr for CharsetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "letters" => Ok(CharsetType::Letters),
            "numbers" => Ok(CharsetType::Numbers),
            "mixed" => Ok(CharsetType::Mixed),
            "hyphenated" => Ok(CharsetType::Hyphenated),
            "idn" => Ok(CharsetType::Idn),
            other => Err(format!("unknown charset type: {}", other)),
        }
    }
}

impl fmt::Display for CharsetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label present in yesterday's zone and absent from today's.
///
/// Unique on `(label, tld, drop_date)`; never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct DropRecord {
    pub id: i64,
    /// The SLD label alone, without the TLD (e.g. `"beta"`).
    pub label: String,
    pub tld: String,
    pub drop_date: NaiveDate,
    /// Rune count of the stored label (encoded form for `xn--` labels).
    pub length: i64,
    /// Always 1 at SLD granularity; reserved for deeper labels.
    pub label_count: i64,
    pub charset_type: CharsetType,
    pub quality_score: Option<i64>,
    pub created_at: i64,
}

impl DropRecord {
    /// Full domain name, `<label>.<tld>`.
    pub fn domain(&self) -> String {
        format!("{}.{}", self.label, self.tld)
    }
}

/// How a watchlist pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Glob,
    Regex,
    Contains,
    Prefix,
    Suffix,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Glob => "glob",
            PatternKind::Regex => "regex",
            PatternKind::Contains => "contains",
            PatternKind::Prefix => "prefix",
            PatternKind::Suffix => "suffix",
        }
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(PatternKind::Glob),
            "regex" => Ok(PatternKind::Regex),
            "contains" => Ok(PatternKind::Contains),
            "prefix" => Ok(PatternKind::Prefix),
            "suffix" => Ok(PatternKind::Suffix),
            other => Err(format!("unknown pattern kind: {}", other)),
        }
    }
}

/// A user-defined filter over drops. Consulted read-only by the matcher.
#[derive(Debug, Clone)]
pub struct Watchlist {
    pub id: i64,
    pub user_id: i64,
    pub name: Option<String>,
    pub is_active: bool,
    pub pattern_kind: PatternKind,
    pub pattern: String,
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
    /// `None` = all TLDs.
    pub allowed_tlds: Option<Vec<String>>,
    /// `None` = all charsets.
    pub allowed_charsets: Option<Vec<CharsetType>>,
    pub min_quality: Option<i64>,
}

/// A recorded watchlist hit, unique on `(watchlist_id, drop_id)`.
#[derive(Debug, Clone, Serialize)]
pub struct WatchlistMatch {
    pub watchlist_id: i64,
    pub drop_id: i64,
    pub matched_at: i64,
}

/// What a scheduled job does for its TLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Download only.
    Ingest,
    /// Parse an existing snapshot only.
    Parse,
    /// Detect from existing snapshots (replay path).
    Detect,
    /// Download, parse, detect, persist, match.
    Full,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::Parse => "parse",
            JobKind::Detect => "detect",
            JobKind::Full => "full",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(JobKind::Ingest),
            "parse" => Ok(JobKind::Parse),
            "detect" => Ok(JobKind::Detect),
            "full" => Ok(JobKind::Full),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled per-TLD job. Unique on `(tld, kind)`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub tld: String,
    pub kind: JobKind,
    /// Cron expression (seconds-first, six fields).
    pub schedule: String,
    pub is_enabled: bool,
    pub timeout_secs: i64,
    pub max_retries: i64,
    pub backoff_base_secs: i64,
}

/// Terminal outcome of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Skipped,
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Skipped => "skipped",
            RunOutcome::Failed => "failed",
            RunOutcome::TimedOut => "timed_out",
        }
    }
}

/// Counters accumulated over one `(tld, date)` cycle, recorded on the
/// JobRun and emitted in the structured run log.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleStats {
    pub bytes_downloaded: u64,
    pub labels_parsed: u64,
    pub drops_detected: u64,
    pub drops_inserted: u64,
    pub drops_skipped: u64,
    pub watchlist_matches: u64,
}

/// Result of a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Drops detected and persisted (possibly zero).
    Completed,
    /// No prior snapshot existed; nothing recorded. Informational.
    NoBaseline,
}

/// Format a civil date the way snapshot files are named (`YYYYMMDD`).
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
