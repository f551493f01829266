//! Streaming zone-file parser.
//!
//! Extracts the set of unique, lowercased SLD labels directly under a TLD
//! from a master-file byte stream. The parser is line-oriented and never
//! holds more than one line plus the dedup set in memory; when the set
//! exceeds the configured label budget it spills sorted runs to disk and
//! merges them into a single sorted, deduplicated label file.
//!
//! # Accepted input
//!
//! - `;` comments and blank lines are skipped.
//! - `$ORIGIN <name>` updates the current origin (initial origin is the
//!   TLD itself); `$TTL` is skipped; any other control directive is a
//!   structural error.
//! - Continuation lines (leading whitespace) repeat the previous owner and
//!   are skipped — that owner was already recorded.
//! - Only the first whitespace-separated token (the owner name) of each
//!   record is consumed. Relative owners are qualified against the current
//!   origin, everything is ASCII-lowercased, and only names of exactly two
//!   labels (`<sld>.<tld>.`) survive.
//! - The SLD must match `[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?` or carry the
//!   `xn--` IDN prefix.

use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::error::CycleError;

/// Deduplicated SLD labels for one `(tld, date)` snapshot.
///
/// Either a hash set (the common case) or, past the memory budget, a
/// sorted, deduplicated on-disk label file.
#[derive(Debug)]
pub enum LabelSet {
    Memory(HashSet<String>),
    Sorted(SortedLabels),
}

impl LabelSet {
    pub fn len(&self) -> u64 {
        match self {
            LabelSet::Memory(set) => set.len() as u64,
            LabelSet::Sorted(file) => file.count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize as a sorted on-disk file (no-op for the sorted variant).
    /// Needed when either side of a diff is too large for memory.
    pub fn into_sorted(self, spill_dir: &Path, tag: &str) -> Result<SortedLabels, CycleError> {
        match self {
            LabelSet::Sorted(file) => Ok(file),
            LabelSet::Memory(set) => {
                let mut labels: Vec<String> = set.into_iter().collect();
                labels.sort_unstable();
                SortedLabels::write(spill_dir, tag, labels.iter().map(|s| s.as_str()))
            }
        }
    }
}

/// A sorted, deduplicated label file, one label per line. The file is
/// removed when the handle drops.
#[derive(Debug)]
pub struct SortedLabels {
    pub path: PathBuf,
    pub count: u64,
}

/// Distinguishes spill files from concurrent per-TLD workers.
static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

impl SortedLabels {
    fn write<'a>(
        dir: &Path,
        tag: &str,
        labels: impl Iterator<Item = &'a str>,
    ) -> Result<Self, CycleError> {
        std::fs::create_dir_all(dir).map_err(CycleError::from_io)?;
        let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}-{}.labels", tag, seq));
        let mut writer = BufWriter::new(File::create(&path).map_err(CycleError::from_io)?);
        let mut count = 0u64;
        for label in labels {
            writer.write_all(label.as_bytes()).map_err(CycleError::from_io)?;
            writer.write_all(b"\n").map_err(CycleError::from_io)?;
            count += 1;
        }
        writer.flush().map_err(CycleError::from_io)?;
        Ok(Self { path, count })
    }

    /// Line iterator over the sorted labels.
    pub fn lines(&self) -> Result<impl Iterator<Item = std::io::Result<String>>, CycleError> {
        let file = File::open(&self.path).map_err(CycleError::from_io)?;
        Ok(BufReader::with_capacity(1 << 20, file).lines())
    }
}

impl Drop for SortedLabels {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Tuning knobs for one parse run.
pub struct ParseOptions {
    /// Unique labels held in memory before spilling to sorted runs.
    pub label_budget: usize,
    /// Cancellation checkpoint interval, in input lines.
    pub checkpoint_lines: u64,
    /// Directory for spill runs and sorted label files.
    pub spill_dir: PathBuf,
}

/// Result of a parse run.
#[derive(Debug)]
pub struct ParseOutcome {
    pub labels: LabelSet,
    pub lines_read: u64,
}

/// Parse a zone byte stream into the set of SLD labels under `tld`.
///
/// `cancel` is observed every [`ParseOptions::checkpoint_lines`] lines;
/// a signalled channel aborts with [`CycleError::Cancelled`].
pub fn parse_zone<R: BufRead>(
    mut reader: R,
    tld: &str,
    opts: &ParseOptions,
    cancel: Option<&watch::Receiver<bool>>,
) -> Result<ParseOutcome, CycleError> {
    let tld = tld.to_ascii_lowercase();
    let mut origin = format!("{}.", tld);

    let mut set: HashSet<String> = HashSet::new();
    let mut runs: Vec<SortedLabels> = Vec::new();
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut lines_read = 0u64;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(CycleError::from_io)?;
        if n == 0 {
            break;
        }
        lines_read += 1;

        if lines_read % opts.checkpoint_lines == 0 {
            if let Some(rx) = cancel {
                if *rx.borrow() {
                    return Err(CycleError::Cancelled);
                }
            }
        }

        // Zone files are ASCII in practice; tolerate stray bytes the way
        // the rest of the line-oriented tooling does.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        let first = line.as_bytes()[0];
        if first == b';' {
            continue;
        }
        // Continuation line: owner repeats the previous record's, which is
        // already in the set.
        if first == b' ' || first == b'\t' {
            continue;
        }

        if first == b'$' {
            apply_directive(line, &tld, &mut origin)?;
            continue;
        }

        let owner = match line.split_ascii_whitespace().next() {
            Some(tok) => tok,
            None => continue,
        };

        if let Some(sld) = extract_sld(owner, &origin, &tld) {
            set.insert(sld);
            if set.len() >= opts.label_budget {
                runs.push(spill_run(&mut set, &opts.spill_dir, runs.len())?);
            }
        }
    }

    let labels = if runs.is_empty() {
        LabelSet::Memory(set)
    } else {
        if !set.is_empty() {
            runs.push(spill_run(&mut set, &opts.spill_dir, runs.len())?);
        }
        LabelSet::Sorted(merge_runs(runs, &opts.spill_dir)?)
    };

    Ok(ParseOutcome { labels, lines_read })
}

/// Handle a `$`-directive line. `$ORIGIN` updates the origin, `$TTL` is
/// ignored, anything else is structural corruption.
fn apply_directive(line: &str, tld: &str, origin: &mut String) -> Result<(), CycleError> {
    let mut parts = line.split_ascii_whitespace();
    let directive = parts.next().unwrap_or_default().to_ascii_uppercase();
    match directive.as_str() {
        "$ORIGIN" => {
            let name = parts
                .next()
                .ok_or_else(|| CycleError::Parser("$ORIGIN without a name".to_string()))?;
            let mut name = name.to_ascii_lowercase();
            if !name.ends_with('.') {
                // Relative $ORIGIN is qualified against the zone apex.
                name = format!("{}.{}.", name, tld);
            }
            *origin = name;
            Ok(())
        }
        "$TTL" => Ok(()),
        other => Err(CycleError::Parser(format!(
            "unsupported control directive: {}",
            other
        ))),
    }
}

/// Qualify an owner token against the origin and return the SLD when the
/// result is exactly `<sld>.<tld>.` with a valid label.
fn extract_sld(owner: &str, origin: &str, tld: &str) -> Option<String> {
    let owner = owner.to_ascii_lowercase();
    let fqdn = if owner == "@" {
        origin.to_string()
    } else if owner.ends_with('.') {
        owner
    } else {
        format!("{}.{}", owner, origin)
    };

    let trimmed = fqdn.strip_suffix('.').unwrap_or(&fqdn);
    let mut labels = trimmed.split('.');
    let sld = labels.next()?;
    let tld_label = labels.next()?;
    if labels.next().is_some() || tld_label != tld {
        return None;
    }
    if !is_valid_sld(sld) {
        return None;
    }
    Some(sld.to_string())
}

/// Label grammar: `[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?`, or an `xn--`
/// IDN prefix. The input is already lowercased.
fn is_valid_sld(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    {
        return false;
    }
    if label.starts_with("xn--") {
        return true;
    }
    let first = bytes[0];
    let last = bytes[bytes.len() - 1];
    first != b'-' && last != b'-'
}

/// Drain the in-memory set into one sorted run file.
fn spill_run(
    set: &mut HashSet<String>,
    spill_dir: &Path,
    index: usize,
) -> Result<SortedLabels, CycleError> {
    let mut labels: Vec<String> = set.drain().collect();
    labels.sort_unstable();
    SortedLabels::write(spill_dir, &format!("run{}", index), labels.iter().map(|s| s.as_str()))
}

/// K-way merge of sorted runs into one sorted, deduplicated label file.
fn merge_runs(runs: Vec<SortedLabels>, spill_dir: &Path) -> Result<SortedLabels, CycleError> {
    use std::cmp::Reverse;

    let mut readers = Vec::with_capacity(runs.len());
    for run in &runs {
        readers.push(BufReader::with_capacity(
            1 << 20,
            File::open(&run.path).map_err(CycleError::from_io)?,
        ));
    }

    let mut heap: BinaryHeap<Reverse<(String, usize)>> = BinaryHeap::new();
    for (i, reader) in readers.iter_mut().enumerate() {
        if let Some(label) = next_line(reader)? {
            heap.push(Reverse((label, i)));
        }
    }

    std::fs::create_dir_all(spill_dir).map_err(CycleError::from_io)?;
    let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
    let out_path = spill_dir.join(format!("merged-{}.labels", seq));
    let mut writer = BufWriter::new(File::create(&out_path).map_err(CycleError::from_io)?);
    let mut count = 0u64;
    let mut last: Option<String> = None;

    while let Some(Reverse((label, i))) = heap.pop() {
        if last.as_deref() != Some(label.as_str()) {
            writer.write_all(label.as_bytes()).map_err(CycleError::from_io)?;
            writer.write_all(b"\n").map_err(CycleError::from_io)?;
            count += 1;
            last = Some(label);
        }
        if let Some(next) = next_line(&mut readers[i])? {
            heap.push(Reverse((next, i)));
        }
    }
    writer.flush().map_err(CycleError::from_io)?;

    // Run files delete themselves on drop.
    drop(runs);

    Ok(SortedLabels {
        path: out_path,
        count,
    })
}

fn next_line(reader: &mut BufReader<File>) -> Result<Option<String>, CycleError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).map_err(CycleError::from_io)?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn opts(tmp: &Path) -> ParseOptions {
        ParseOptions {
            label_budget: 20_000_000,
            checkpoint_lines: 100_000,
            spill_dir: tmp.to_path_buf(),
        }
    }

    fn parse_str(zone: &str, tld: &str, opts: &ParseOptions) -> HashSet<String> {
        match parse_zone(Cursor::new(zone), tld, opts, None).unwrap().labels {
            LabelSet::Memory(set) => set,
            LabelSet::Sorted(file) => file
                .lines()
                .unwrap()
                .collect::<std::io::Result<HashSet<_>>>()
                .unwrap(),
        }
    }

    #[test]
    fn extracts_unique_slds() {
        let tmp = tempfile::tempdir().unwrap();
        let zone = "\
dev. 300 IN SOA ns1.dev. hostmaster.dev. 1 2 3 4 5
dev. 300 IN NS ns1.example.
alpha.dev. 300 IN NS ns1.example.
alpha.dev. 300 IN NS ns2.example.
beta.dev. 300 IN NS ns1.example.
www.alpha.dev. 300 IN A 192.0.2.1
";
        let set = parse_str(zone, "dev", &opts(tmp.path()));
        assert_eq!(
            set,
            HashSet::from(["alpha".to_string(), "beta".to_string()])
        );
    }

    #[test]
    fn comments_blanks_and_continuations_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let zone = "\
; zone file for dev
alpha.dev. 300 IN MX 10 mail.alpha.dev.

\t300 IN MX 20 mail2.alpha.dev.
; trailing comment
";
        let set = parse_str(zone, "dev", &opts(tmp.path()));
        assert_eq!(set, HashSet::from(["alpha".to_string()]));
    }

    #[test]
    fn origin_qualifies_relative_owners() {
        let tmp = tempfile::tempdir().unwrap();
        let zone = "\
$ORIGIN dev.
$TTL 300
alpha 300 IN NS ns1.example.
beta.dev. 300 IN NS ns1.example.
@ 300 IN NS ns1.example.
";
        let set = parse_str(zone, "dev", &opts(tmp.path()));
        assert_eq!(
            set,
            HashSet::from(["alpha".to_string(), "beta".to_string()])
        );
    }

    #[test]
    fn case_folds_owners() {
        let tmp = tempfile::tempdir().unwrap();
        let zone = "ALPHA.DEV. 300 IN NS ns1.example.\nAlpha.dev. 300 IN NS ns2.example.\n";
        let set = parse_str(zone, "dev", &opts(tmp.path()));
        assert_eq!(set, HashSet::from(["alpha".to_string()]));
    }

    #[test]
    fn rejects_wrong_tld_and_bad_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let zone = "\
alpha.org. 300 IN NS ns1.example.
-bad.dev. 300 IN NS ns1.example.
bad-.dev. 300 IN NS ns1.example.
ok-name.dev. 300 IN NS ns1.example.
xn--caf-dma.dev. 300 IN NS ns1.example.
";
        let set = parse_str(zone, "dev", &opts(tmp.path()));
        assert_eq!(
            set,
            HashSet::from(["ok-name".to_string(), "xn--caf-dma".to_string()])
        );
    }

    #[test]
    fn order_and_whitespace_do_not_change_output() {
        let tmp = tempfile::tempdir().unwrap();
        let a = "alpha.dev. 300 IN NS ns1.example.\nbeta.dev. 300 IN NS ns1.example.\n";
        let b = "beta.dev.\t600\tIN\tNS\tns2.example.\n\n; noise\nalpha.dev. 300 IN NS ns1.example.\n";
        assert_eq!(
            parse_str(a, "dev", &opts(tmp.path())),
            parse_str(b, "dev", &opts(tmp.path()))
        );
    }

    #[test]
    fn unknown_directive_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = parse_zone(
            Cursor::new("$GENERATE 1-10 host$ A 192.0.2.$\n"),
            "dev",
            &opts(tmp.path()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CycleError::Parser(_)));
    }

    #[test]
    fn origin_without_name_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = parse_zone(Cursor::new("$ORIGIN\n"), "dev", &opts(tmp.path()), None)
            .unwrap_err();
        assert!(matches!(err, CycleError::Parser(_)));
    }

    #[test]
    fn spills_and_merges_past_label_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let mut zone = String::new();
        for i in 0..100 {
            zone.push_str(&format!("name{:03}.dev. 300 IN NS ns1.example.\n", i));
        }
        // Duplicates across the spill boundary must still dedup.
        zone.push_str("name001.dev. 300 IN NS ns2.example.\n");

        let mut o = opts(tmp.path());
        o.label_budget = 16;
        let outcome = parse_zone(Cursor::new(zone.as_str()), "dev", &o, None).unwrap();

        match &outcome.labels {
            LabelSet::Sorted(file) => {
                assert_eq!(file.count, 100);
                let labels: Vec<String> =
                    file.lines().unwrap().collect::<std::io::Result<_>>().unwrap();
                let mut sorted = labels.clone();
                sorted.sort();
                assert_eq!(labels, sorted, "merged file must be sorted");
            }
            LabelSet::Memory(_) => panic!("expected spill to disk"),
        }
    }

    #[test]
    fn cancellation_is_observed_at_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let mut zone = String::new();
        for i in 0..50 {
            zone.push_str(&format!("n{}.dev. 300 IN NS ns1.example.\n", i));
        }
        let mut o = opts(tmp.path());
        o.checkpoint_lines = 10;

        let (tx, rx) = watch::channel(true);
        let err = parse_zone(Cursor::new(zone.as_str()), "dev", &o, Some(&rx)).unwrap_err();
        assert!(matches!(err, CycleError::Cancelled));
        drop(tx);
    }
}
