//! Watchlist matching over freshly persisted drops.
//!
//! Active watchlists load once per cycle into an in-memory index
//! partitioned by `allowed_tlds` (lists without a TLD restriction land in
//! a wildcard bucket). Patterns compile exactly once at load time; a
//! watchlist whose pattern fails to compile is deactivated with a stored
//! reason instead of aborting the matcher.
//!
//! Per drop, predicates evaluate in cost order and short-circuit on the
//! first failure: TLD filter, length bounds, charset filter, quality
//! threshold, pattern. Matches are deduplicated by the
//! `(watchlist_id, drop_id)` unique key, and each new match enqueues a
//! notification request.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use crate::models::{CharsetType, DropRecord, PatternKind, WatchlistMatch};
use crate::notify;

/// A watchlist with its pattern compiled for repeated evaluation.
pub struct CompiledWatchlist {
    pub id: i64,
    pub user_id: i64,
    pattern: CompiledPattern,
    min_length: Option<i64>,
    max_length: Option<i64>,
    allowed_tlds: Option<Vec<String>>,
    allowed_charsets: Option<Vec<CharsetType>>,
    min_quality: Option<i64>,
}

enum CompiledPattern {
    Glob(GlobMatcher),
    Regex(Regex),
    Contains(String),
    Prefix(String),
    Suffix(String),
}

impl CompiledWatchlist {
    /// All five predicates, short-circuiting in cost order.
    pub fn matches(&self, drop: &DropRecord) -> bool {
        if let Some(tlds) = &self.allowed_tlds {
            if !tlds.iter().any(|t| t == &drop.tld) {
                return false;
            }
        }
        if let Some(min) = self.min_length {
            if drop.length < min {
                return false;
            }
        }
        if let Some(max) = self.max_length {
            if drop.length > max {
                return false;
            }
        }
        if let Some(charsets) = &self.allowed_charsets {
            if !charsets.contains(&drop.charset_type) {
                return false;
            }
        }
        if let Some(min_quality) = self.min_quality {
            match drop.quality_score {
                Some(score) if score >= min_quality => {}
                _ => return false,
            }
        }
        match &self.pattern {
            CompiledPattern::Glob(glob) => glob.is_match(&drop.label),
            CompiledPattern::Regex(re) => re.is_match(&drop.label),
            CompiledPattern::Contains(needle) => drop.label.contains(needle.as_str()),
            CompiledPattern::Prefix(prefix) => drop.label.starts_with(prefix.as_str()),
            CompiledPattern::Suffix(suffix) => drop.label.ends_with(suffix.as_str()),
        }
    }
}

/// Active watchlists, indexed by allowed TLD for O(1) candidate lookup.
pub struct WatchlistIndex {
    lists: Vec<CompiledWatchlist>,
    by_tld: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
}

impl WatchlistIndex {
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Watchlists whose TLD filter admits `tld`.
    fn candidates(&self, tld: &str) -> impl Iterator<Item = &CompiledWatchlist> {
        self.wildcard
            .iter()
            .chain(self.by_tld.get(tld).into_iter().flatten())
            .map(|&i| &self.lists[i])
    }

    fn from_lists(lists: Vec<CompiledWatchlist>) -> Self {
        let mut by_tld: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard = Vec::new();
        for (i, list) in lists.iter().enumerate() {
            match &list.allowed_tlds {
                None => wildcard.push(i),
                Some(tlds) => {
                    for tld in tlds {
                        by_tld.entry(tld.clone()).or_default().push(i);
                    }
                }
            }
        }
        Self {
            lists,
            by_tld,
            wildcard,
        }
    }
}

/// Load and compile every active watchlist. Uncompilable patterns
/// deactivate their watchlist with a structured reason.
pub async fn load_active(pool: &SqlitePool) -> Result<WatchlistIndex> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, pattern_kind, pattern, min_length, max_length,
               allowed_tlds, allowed_charsets, min_quality
        FROM watchlists
        WHERE is_active = 1
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut lists = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let kind_str: String = row.get("pattern_kind");
        let pattern_str: String = row.get("pattern");

        let kind = match PatternKind::from_str(&kind_str) {
            Ok(kind) => kind,
            Err(reason) => {
                deactivate(pool, id, &reason).await?;
                continue;
            }
        };

        match compile_pattern(kind, &pattern_str) {
            Ok(pattern) => lists.push(CompiledWatchlist {
                id,
                user_id: row.get("user_id"),
                pattern,
                min_length: row.get("min_length"),
                max_length: row.get("max_length"),
                allowed_tlds: parse_csv(row.get::<Option<String>, _>("allowed_tlds")),
                allowed_charsets: parse_charsets(row.get::<Option<String>, _>("allowed_charsets")),
                min_quality: row.get("min_quality"),
            }),
            Err(err) => {
                deactivate(pool, id, &format!("invalid pattern: {}", err)).await?;
            }
        }
    }

    Ok(WatchlistIndex::from_lists(lists))
}

fn compile_pattern(kind: PatternKind, pattern: &str) -> Result<CompiledPattern> {
    match kind {
        PatternKind::Glob => {
            let glob = Glob::new(pattern).context("glob pattern")?;
            Ok(CompiledPattern::Glob(glob.compile_matcher()))
        }
        PatternKind::Regex => {
            // Anchored unless the user brings their own anchors.
            let anchored = if pattern.starts_with('^') || pattern.ends_with('$') {
                pattern.to_string()
            } else {
                format!("^(?:{})$", pattern)
            };
            let re = Regex::new(&anchored).context("regex pattern")?;
            Ok(CompiledPattern::Regex(re))
        }
        PatternKind::Contains => Ok(CompiledPattern::Contains(pattern.to_string())),
        PatternKind::Prefix => Ok(CompiledPattern::Prefix(pattern.to_string())),
        PatternKind::Suffix => Ok(CompiledPattern::Suffix(pattern.to_string())),
    }
}

async fn deactivate(pool: &SqlitePool, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE watchlists SET is_active = 0, disabled_reason = ?, updated_at = ? WHERE id = ?",
    )
    .bind(reason)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

fn parse_csv(value: Option<String>) -> Option<Vec<String>> {
    let value = value?;
    let items: Vec<String> = value
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn parse_charsets(value: Option<String>) -> Option<Vec<CharsetType>> {
    let items = parse_csv(value)?;
    let charsets: Vec<CharsetType> = items
        .iter()
        .filter_map(|s| CharsetType::from_str(s).ok())
        .collect();
    if charsets.is_empty() {
        None
    } else {
        Some(charsets)
    }
}

/// Evaluate a batch of freshly inserted drops against the index.
///
/// Each new `(watchlist_id, drop_id)` pair is recorded and a notification
/// request enqueued; pairs already recorded (replays) are skipped by the
/// unique constraint.
pub async fn match_drops(
    pool: &SqlitePool,
    index: &WatchlistIndex,
    drops: &[DropRecord],
) -> Result<Vec<WatchlistMatch>> {
    let mut matches = Vec::new();
    if index.is_empty() || drops.is_empty() {
        return Ok(matches);
    }

    for drop in drops {
        for list in index.candidates(&drop.tld) {
            if !list.matches(drop) {
                continue;
            }

            let now = Utc::now().timestamp();
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO watchlist_matches (watchlist_id, drop_id, matched_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(list.id)
            .bind(drop.id)
            .bind(now)
            .execute(pool)
            .await?;

            if result.rows_affected() == 1 {
                notify::submit_notification(pool, list.user_id, list.id, drop).await?;
                matches.push(WatchlistMatch {
                    watchlist_id: list.id,
                    drop_id: drop.id,
                    matched_at: now,
                });
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn drop_record(label: &str, tld: &str) -> DropRecord {
        DropRecord {
            id: 1,
            label: label.to_string(),
            tld: tld.to_string(),
            drop_date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            length: label.chars().count() as i64,
            label_count: 1,
            charset_type: CharsetType::classify(label),
            quality_score: Some(50),
            created_at: 0,
        }
    }

    fn watchlist(kind: PatternKind, pattern: &str) -> CompiledWatchlist {
        CompiledWatchlist {
            id: 1,
            user_id: 1,
            pattern: compile_pattern(kind, pattern).unwrap(),
            min_length: None,
            max_length: None,
            allowed_tlds: None,
            allowed_charsets: None,
            min_quality: None,
        }
    }

    #[test]
    fn glob_pattern_with_filters() {
        let mut list = watchlist(PatternKind::Glob, "a*");
        list.allowed_tlds = Some(vec!["dev".to_string()]);
        list.min_length = Some(3);

        assert!(list.matches(&drop_record("alpha", "dev")));
        // Length filter rejects before the pattern runs.
        assert!(!list.matches(&drop_record("al", "dev")));
        // TLD filter rejects first.
        assert!(!list.matches(&drop_record("alpha", "org")));
        assert!(!list.matches(&drop_record("beta", "dev")));
    }

    #[test]
    fn regex_is_anchored_by_default() {
        let list = watchlist(PatternKind::Regex, "a.b");
        assert!(list.matches(&drop_record("axb", "dev")));
        assert!(!list.matches(&drop_record("zaxbz", "dev")));

        let explicit = watchlist(PatternKind::Regex, "^ax");
        assert!(explicit.matches(&drop_record("axb", "dev")));
    }

    #[test]
    fn contains_prefix_suffix() {
        assert!(watchlist(PatternKind::Contains, "lph").matches(&drop_record("alpha", "dev")));
        assert!(watchlist(PatternKind::Prefix, "al").matches(&drop_record("alpha", "dev")));
        assert!(watchlist(PatternKind::Suffix, "ha").matches(&drop_record("alpha", "dev")));
        assert!(!watchlist(PatternKind::Suffix, "al").matches(&drop_record("alpha", "dev")));
    }

    #[test]
    fn charset_filter() {
        let mut list = watchlist(PatternKind::Glob, "*");
        list.allowed_charsets = Some(vec![CharsetType::Letters]);
        assert!(list.matches(&drop_record("alpha", "dev")));
        assert!(!list.matches(&drop_record("web3", "dev")));
    }

    #[test]
    fn quality_threshold_requires_a_score() {
        let mut list = watchlist(PatternKind::Glob, "*");
        list.min_quality = Some(40);

        assert!(list.matches(&drop_record("alpha", "dev")));

        let mut unscored = drop_record("alpha", "dev");
        unscored.quality_score = None;
        assert!(!list.matches(&unscored));

        let mut low = drop_record("alpha", "dev");
        low.quality_score = Some(10);
        assert!(!list.matches(&low));
    }

    #[test]
    fn invalid_regex_fails_compilation() {
        assert!(compile_pattern(PatternKind::Regex, "a(b").is_err());
    }

    #[test]
    fn index_partitions_by_tld() {
        let mut dev_only = watchlist(PatternKind::Glob, "*");
        dev_only.allowed_tlds = Some(vec!["dev".to_string()]);
        let anywhere = watchlist(PatternKind::Glob, "*");

        let index = WatchlistIndex::from_lists(vec![dev_only, anywhere]);
        assert_eq!(index.candidates("dev").count(), 2);
        assert_eq!(index.candidates("org").count(), 1);
    }

    #[test]
    fn csv_parsing() {
        assert_eq!(
            parse_csv(Some("dev, ORG ,app".to_string())),
            Some(vec!["dev".to_string(), "org".to_string(), "app".to_string()])
        );
        assert_eq!(parse_csv(Some("  ".to_string())), None);
        assert_eq!(parse_csv(None), None);
    }
}
