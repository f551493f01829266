//! Drop detection: the set difference of adjacent daily label sets.
//!
//! A drop is a label present in yesterday's zone and absent from today's.
//! Two diff strategies, chosen by where the parser left the sets:
//!
//! - **In-memory**: both sets fit in RAM → `HashSet` difference.
//! - **External merge**: either set spilled to disk → both sides are
//!   materialized as lexicographically sorted label files and a linear
//!   two-pointer walk emits elements of `prev` missing from `today`.
//!
//! Emission order follows the strategy's natural order; consumers must not
//! depend on it. Metadata (length, charset class, quality score) is derived
//! per label; a missing or failing scorer stores a NULL score and never
//! blocks detection.

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::path::Path;

use crate::error::CycleError;
use crate::models::CharsetType;
use crate::parser::LabelSet;
use crate::quality::QualityScorer;

/// A detected drop before persistence assigns it a row id.
#[derive(Debug, Clone)]
pub struct NewDrop {
    pub label: String,
    pub tld: String,
    pub drop_date: NaiveDate,
    pub length: i64,
    pub label_count: i64,
    pub charset_type: CharsetType,
    pub quality_score: Option<i64>,
}

/// Compute `prev \ today` and derive per-drop metadata.
pub fn detect_drops(
    prev: LabelSet,
    today: LabelSet,
    tld: &str,
    date: NaiveDate,
    spill_dir: &Path,
    scorer: Option<&dyn QualityScorer>,
) -> Result<Vec<NewDrop>, CycleError> {
    let dropped = diff_labels(prev, today, spill_dir)?;
    Ok(derive_drops(dropped, tld, date, scorer))
}

/// Attach metadata to freshly diffed labels.
pub fn derive_drops(
    labels: Vec<String>,
    tld: &str,
    date: NaiveDate,
    scorer: Option<&dyn QualityScorer>,
) -> Vec<NewDrop> {
    labels
        .into_iter()
        .map(|label| derive(label, tld, date, scorer))
        .collect()
}

/// The labels in `prev` that are absent from `today`.
pub fn diff_labels(
    prev: LabelSet,
    today: LabelSet,
    spill_dir: &Path,
) -> Result<Vec<String>, CycleError> {
    match (prev, today) {
        (LabelSet::Memory(prev), LabelSet::Memory(today)) => Ok(prev
            .into_iter()
            .filter(|label| !today.contains(label))
            .collect()),
        (prev, today) => {
            let prev = prev.into_sorted(spill_dir, "diff-prev")?;
            let today = today.into_sorted(spill_dir, "diff-today")?;
            sorted_difference(&prev, &today)
        }
    }
}

/// Two-pointer walk over two sorted label files.
fn sorted_difference(
    prev: &crate::parser::SortedLabels,
    today: &crate::parser::SortedLabels,
) -> Result<Vec<String>, CycleError> {
    let mut prev_lines = prev.lines()?;
    let mut today_lines = today.lines()?;

    let mut dropped = Vec::new();
    let mut p = next(&mut prev_lines)?;
    let mut t = next(&mut today_lines)?;

    while let Some(prev_label) = p.as_deref() {
        match t.as_deref() {
            None => {
                dropped.push(prev_label.to_string());
                p = next(&mut prev_lines)?;
            }
            Some(today_label) => match prev_label.cmp(today_label) {
                Ordering::Less => {
                    dropped.push(prev_label.to_string());
                    p = next(&mut prev_lines)?;
                }
                Ordering::Equal => {
                    p = next(&mut prev_lines)?;
                    t = next(&mut today_lines)?;
                }
                Ordering::Greater => {
                    t = next(&mut today_lines)?;
                }
            },
        }
    }

    Ok(dropped)
}

fn next(
    iter: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<Option<String>, CycleError> {
    iter.next().transpose().map_err(CycleError::from_io)
}

fn derive(label: String, tld: &str, date: NaiveDate, scorer: Option<&dyn QualityScorer>) -> NewDrop {
    let length = label.chars().count() as i64;
    let charset_type = CharsetType::classify(&label);
    let quality_score = scorer.and_then(|s| s.score(&label, tld));
    NewDrop {
        label,
        tld: tld.to_string(),
        drop_date: date,
        length,
        label_count: 1,
        charset_type,
        quality_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
    }

    fn mem(labels: &[&str]) -> LabelSet {
        LabelSet::Memory(labels.iter().map(|s| s.to_string()).collect())
    }

    fn sorted(labels: &[&str], dir: &Path, tag: &str) -> LabelSet {
        let set = mem(labels);
        LabelSet::Sorted(set.into_sorted(dir, tag).unwrap())
    }

    fn label_set(drops: &[NewDrop]) -> HashSet<String> {
        drops.iter().map(|d| d.label.clone()).collect()
    }

    #[test]
    fn memory_difference_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let drops = detect_drops(
            mem(&["alpha", "beta", "gamma"]),
            mem(&["alpha", "gamma", "delta"]),
            "dev",
            day(),
            tmp.path(),
            None,
        )
        .unwrap();
        assert_eq!(label_set(&drops), HashSet::from(["beta".to_string()]));
    }

    #[test]
    fn sorted_difference_matches_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let prev = &["alpha", "beta", "gamma", "zeta"];
        let today = &["alpha", "delta", "zeta"];

        let from_memory = diff_labels(mem(prev), mem(today), tmp.path()).unwrap();
        let from_files = diff_labels(
            sorted(prev, tmp.path(), "p"),
            sorted(today, tmp.path(), "t"),
            tmp.path(),
        )
        .unwrap();

        let a: HashSet<_> = from_memory.into_iter().collect();
        let b: HashSet<_> = from_files.into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a, HashSet::from(["beta".to_string(), "gamma".to_string()]));
    }

    #[test]
    fn mixed_memory_and_sorted_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let diff = diff_labels(
            mem(&["a", "b", "c"]),
            sorted(&["b"], tmp.path(), "t"),
            tmp.path(),
        )
        .unwrap();
        let got: HashSet<_> = diff.into_iter().collect();
        assert_eq!(got, HashSet::from(["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn empty_today_drops_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let diff = diff_labels(mem(&["a", "b"]), mem(&[]), tmp.path()).unwrap();
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn identical_sets_drop_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let diff = diff_labels(mem(&["a", "b"]), mem(&["a", "b"]), tmp.path()).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn metadata_for_letters_and_idn_and_hyphen() {
        let tmp = tempfile::tempdir().unwrap();
        let drops = detect_drops(
            mem(&["beta", "xn--caf-dma", "co-op"]),
            mem(&[]),
            "org",
            day(),
            tmp.path(),
            None,
        )
        .unwrap();

        let by_label: std::collections::HashMap<_, _> =
            drops.iter().map(|d| (d.label.as_str(), d)).collect();

        let beta = by_label["beta"];
        assert_eq!(beta.length, 4);
        assert_eq!(beta.charset_type, CharsetType::Letters);
        assert_eq!(beta.label_count, 1);

        let idn = by_label["xn--caf-dma"];
        assert_eq!(idn.charset_type, CharsetType::Idn);
        // Encoded-form rune count.
        assert_eq!(idn.length, 11);

        let hyphen = by_label["co-op"];
        assert_eq!(hyphen.charset_type, CharsetType::Hyphenated);
        assert!(hyphen.quality_score.is_none());
    }

    #[test]
    fn scorer_failure_stores_null() {
        struct Failing;
        impl QualityScorer for Failing {
            fn score(&self, _: &str, _: &str) -> Option<i64> {
                None
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let drops = detect_drops(
            mem(&["beta"]),
            mem(&[]),
            "dev",
            day(),
            tmp.path(),
            Some(&Failing),
        )
        .unwrap();
        assert!(drops[0].quality_score.is_none());
    }

    #[test]
    fn scorer_result_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let scorer = crate::quality::HeuristicScorer;
        let drops = detect_drops(
            mem(&["cloud"]),
            mem(&[]),
            "dev",
            day(),
            tmp.path(),
            Some(&scorer),
        )
        .unwrap();
        assert!(drops[0].quality_score.is_some());
    }
}
