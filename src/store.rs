//! Filesystem-backed zone snapshot store.
//!
//! Authoritative persistence of daily zone files, content-addressed by
//! `(tld, date)`. Layout on disk is canonical:
//!
//! ```text
//! <data_root>/zones/<tld>/<YYYYMMDD>.zone[.gz]
//! ```
//!
//! # Atomicity
//!
//! `reserve` opens `<YYYYMMDD>.zone.part`; bytes stream into the part file
//! and are only published by `commit`, which fsyncs, verifies the declared
//! size, and renames into place. A crash at any byte leaves only a `.part`
//! file, which `exists` and `open` never observe. Interrupted downloads can
//! reopen the part file and resume from its current length.
//!
//! # Compression
//!
//! CZDS bodies are usually gzip. The raw stream is stored as received; the
//! handle records whether it saw a gzip magic and `commit` picks the `.gz`
//! suffix accordingly. `open` decompresses transparently.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::models::{compact_date, ZoneSnapshot};

/// First two bytes of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct ZoneStore {
    root: PathBuf,
}

impl ZoneStore {
    /// A store rooted at `<data_dir>/zones`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("zones"),
        }
    }

    fn tld_dir(&self, tld: &str) -> PathBuf {
        self.root.join(tld)
    }

    fn plain_path(&self, tld: &str, date: NaiveDate) -> PathBuf {
        self.tld_dir(tld).join(format!("{}.zone", compact_date(date)))
    }

    fn gz_path(&self, tld: &str, date: NaiveDate) -> PathBuf {
        self.tld_dir(tld)
            .join(format!("{}.zone.gz", compact_date(date)))
    }

    /// Path of the committed snapshot for `(tld, date)`, if one exists.
    pub fn committed_path(&self, tld: &str, date: NaiveDate) -> Option<PathBuf> {
        let plain = self.plain_path(tld, date);
        if plain.is_file() {
            return Some(plain);
        }
        let gz = self.gz_path(tld, date);
        if gz.is_file() {
            return Some(gz);
        }
        None
    }

    pub fn exists(&self, tld: &str, date: NaiveDate) -> bool {
        self.committed_path(tld, date).is_some()
    }

    /// Reserve the `(tld, date)` slot for writing.
    ///
    /// Fails if a complete snapshot already exists. An existing `.part`
    /// file from an interrupted download is reopened in append mode so the
    /// client can resume with a `Range` request.
    pub fn reserve(&self, tld: &str, date: NaiveDate) -> Result<SnapshotHandle> {
        if self.exists(tld, date) {
            bail!("snapshot already exists for {}/{}", tld, compact_date(date));
        }

        let dir = self.tld_dir(tld);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create zone directory: {}", dir.display()))?;

        let part_path = dir.join(format!("{}.zone.part", compact_date(date)));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .with_context(|| format!("Failed to open part file: {}", part_path.display()))?;
        let existing = file.metadata()?.len();
        let head = read_head(&part_path, existing);

        Ok(SnapshotHandle {
            tld: tld.to_string(),
            date,
            dir,
            part_path,
            file,
            bytes_written: existing,
            // Resumed bytes can't be re-hashed incrementally; commit rehashes
            // the whole file when a resume happened.
            hasher: if existing == 0 { Some(Sha256::new()) } else { None },
            head,
        })
    }

    /// Lazy byte stream over a committed snapshot, decompressing when the
    /// snapshot is stored gzipped.
    pub fn open(&self, tld: &str, date: NaiveDate) -> Result<Box<dyn BufRead + Send>> {
        let path = self
            .committed_path(tld, date)
            .ok_or_else(|| anyhow::anyhow!("no snapshot for {}/{}", tld, compact_date(date)))?;
        open_zone_file(&path)
    }

    /// Most recent snapshot date strictly before `date`, if any.
    pub fn latest_before(&self, tld: &str, date: NaiveDate) -> Result<Option<NaiveDate>> {
        Ok(self
            .snapshot_dates(tld)?
            .into_iter()
            .filter(|d| *d < date)
            .max())
    }

    /// All committed snapshot dates for a TLD, unsorted.
    pub fn snapshot_dates(&self, tld: &str) -> Result<Vec<NaiveDate>> {
        let dir = self.tld_dir(tld);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut dates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = if let Some(s) = name.strip_suffix(".zone.gz") {
                s
            } else if let Some(s) = name.strip_suffix(".zone") {
                s
            } else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y%m%d") {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    /// Remove the oldest snapshots beyond `keep`. Returns how many files
    /// were deleted. `keep` is clamped to 2 so adjacent-day diffs always
    /// have their baseline.
    pub fn prune(&self, tld: &str, keep: usize) -> Result<usize> {
        let keep = keep.max(2);
        let mut dates = self.snapshot_dates(tld)?;
        if dates.len() <= keep {
            return Ok(0);
        }
        dates.sort();
        let evict = dates.len() - keep;
        let mut removed = 0;
        for date in dates.into_iter().take(evict) {
            if let Some(path) = self.committed_path(tld, date) {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to prune {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rename a corrupt snapshot out of the way with a `.bad` suffix so the
    /// next cycle re-downloads it.
    pub fn quarantine(&self, tld: &str, date: NaiveDate) -> Result<PathBuf> {
        let path = self
            .committed_path(tld, date)
            .ok_or_else(|| anyhow::anyhow!("no snapshot for {}/{}", tld, compact_date(date)))?;
        let bad = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => "gz.bad",
            _ => "zone.bad",
        });
        fs::rename(&path, &bad)
            .with_context(|| format!("Failed to quarantine {}", path.display()))?;
        Ok(bad)
    }
}

/// Open a zone file for reading, decompressing `.gz` transparently.
pub fn open_zone_file(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open zone file: {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(BufReader::with_capacity(
            1 << 20,
            GzDecoder::new(BufReader::with_capacity(1 << 20, file)),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
    }
}

/// Exclusive write handle for a reserved `(tld, date)` slot.
///
/// Only the owning coordinator writes to it; everything stays in the
/// `.part` file until [`SnapshotHandle::commit`].
pub struct SnapshotHandle {
    tld: String,
    date: NaiveDate,
    dir: PathBuf,
    part_path: PathBuf,
    file: File,
    bytes_written: u64,
    hasher: Option<Sha256>,
    head: [u8; 2],
}

impl SnapshotHandle {
    pub fn tld(&self) -> &str {
        &self.tld
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Bytes already in the part file (nonzero when resuming).
    pub fn len(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// Append a chunk of the response body.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        for (i, b) in chunk.iter().enumerate() {
            let pos = self.bytes_written as usize + i;
            if pos < 2 {
                self.head[pos] = *b;
            } else {
                break;
            }
        }
        self.file.write_all(chunk)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Throw away any partial bytes and start the download over. Used when
    /// resumption validators no longer match or the server ignored the
    /// `Range` request.
    pub fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.flush()?;
        self.bytes_written = 0;
        self.hasher = Some(Sha256::new());
        self.head = [0u8; 2];
        Ok(())
    }

    /// Discard the reservation and its partial bytes. Used when resumption
    /// validators no longer match and the download must restart.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        if self.part_path.exists() {
            fs::remove_file(&self.part_path)
                .with_context(|| format!("Failed to discard {}", self.part_path.display()))?;
        }
        Ok(())
    }

    /// Atomically publish the snapshot.
    ///
    /// Verifies the byte count against `expected_size` when the source
    /// declared one, fsyncs, computes the digest, and renames the part file
    /// to its final name (`.zone` or `.zone.gz` depending on the payload).
    pub fn commit(mut self, expected_size: Option<u64>, fetched_at: i64) -> Result<ZoneSnapshot> {
        self.file.flush()?;
        self.file.sync_all()?;

        if let Some(expected) = expected_size {
            if self.bytes_written != expected {
                let partial = self.bytes_written;
                self.discard()?;
                bail!(
                    "incomplete download: got {} bytes, source declared {}",
                    partial,
                    expected
                );
            }
        }
        if self.bytes_written == 0 {
            self.discard()?;
            bail!("empty download");
        }

        let sha256 = match self.hasher.take() {
            Some(hasher) => hex::encode(hasher.finalize()),
            // Resumed download: hash the whole part file.
            None => hash_file(&self.part_path)?,
        };

        let gzip = self.bytes_written >= 2 && self.head == GZIP_MAGIC;
        let final_name = if gzip {
            format!("{}.zone.gz", compact_date(self.date))
        } else {
            format!("{}.zone", compact_date(self.date))
        };
        let final_path = self.dir.join(final_name);

        drop(self.file);
        fs::rename(&self.part_path, &final_path).with_context(|| {
            format!(
                "Failed to publish snapshot: {} -> {}",
                self.part_path.display(),
                final_path.display()
            )
        })?;

        Ok(ZoneSnapshot {
            tld: self.tld,
            date: self.date,
            path: final_path.display().to_string(),
            size_bytes: self.bytes_written as i64,
            sha256,
            fetched_at,
        })
    }
}

/// First two bytes of an existing part file (for gzip sniffing on resume).
fn read_head(path: &Path, existing: u64) -> [u8; 2] {
    let mut head = [0u8; 2];
    if existing >= 2 {
        if let Ok(mut f) = File::open(path) {
            let _ = f.read_exact(&mut head);
        }
    }
    head
}

fn hash_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(1 << 20, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn reserve_commit_open_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 1, 1);

        let mut handle = store.reserve("dev", date).unwrap();
        handle.write_chunk(b"alpha.dev. 300 IN NS ns1.example.\n").unwrap();
        let snap = handle.commit(None, 1_700_000_000).unwrap();

        assert!(store.exists("dev", date));
        assert_eq!(snap.tld, "dev");
        assert!(snap.path.ends_with("20250101.zone"));
        assert_eq!(snap.size_bytes, 34);

        let mut body = String::new();
        store.open("dev", date).unwrap().read_to_string(&mut body).unwrap();
        assert!(body.contains("alpha.dev."));
    }

    #[test]
    fn uncommitted_part_is_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 1, 1);

        let mut handle = store.reserve("dev", date).unwrap();
        handle.write_chunk(b"partial bytes").unwrap();
        // No commit: the slot must still read as absent.
        assert!(!store.exists("dev", date));
        assert!(store.open("dev", date).is_err());
        drop(handle);

        // And the next reserve resumes the part file.
        let handle = store.reserve("dev", date).unwrap();
        assert_eq!(handle.len(), 13);
    }

    #[test]
    fn size_mismatch_rejects_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 1, 1);

        let mut handle = store.reserve("dev", date).unwrap();
        handle.write_chunk(b"short").unwrap();
        assert!(handle.commit(Some(100), 0).is_err());
        assert!(!store.exists("dev", date));
    }

    #[test]
    fn reserve_fails_on_existing_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 1, 1);

        let mut handle = store.reserve("dev", date).unwrap();
        handle.write_chunk(b"x.dev. NS a.\n").unwrap();
        handle.commit(None, 0).unwrap();

        assert!(store.reserve("dev", date).is_err());
    }

    #[test]
    fn gzip_payload_gets_gz_suffix_and_decompresses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 3, 1);

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"beta.org. 300 IN NS ns1.example.\n").unwrap();
        let gz_bytes = encoder.finish().unwrap();

        let mut handle = store.reserve("org", date).unwrap();
        handle.write_chunk(&gz_bytes).unwrap();
        let snap = handle.commit(Some(gz_bytes.len() as u64), 0).unwrap();
        assert!(snap.path.ends_with("20250301.zone.gz"));

        let mut body = String::new();
        store.open("org", date).unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "beta.org. 300 IN NS ns1.example.\n");
    }

    #[test]
    fn latest_before_picks_adjacent_day() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());

        for d in [day(2025, 1, 1), day(2025, 1, 2), day(2025, 1, 5)] {
            let mut h = store.reserve("dev", d).unwrap();
            h.write_chunk(b"a.dev. NS b.\n").unwrap();
            h.commit(None, 0).unwrap();
        }

        assert_eq!(
            store.latest_before("dev", day(2025, 1, 5)).unwrap(),
            Some(day(2025, 1, 2))
        );
        assert_eq!(
            store.latest_before("dev", day(2025, 1, 1)).unwrap(),
            None
        );
    }

    #[test]
    fn prune_keeps_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());

        for d in 1..=5 {
            let mut h = store.reserve("dev", day(2025, 1, d)).unwrap();
            h.write_chunk(b"a.dev. NS b.\n").unwrap();
            h.commit(None, 0).unwrap();
        }

        let removed = store.prune("dev", 2).unwrap();
        assert_eq!(removed, 3);
        assert!(!store.exists("dev", day(2025, 1, 3)));
        assert!(store.exists("dev", day(2025, 1, 4)));
        assert!(store.exists("dev", day(2025, 1, 5)));

        // keep below 2 is clamped
        assert_eq!(store.prune("dev", 0).unwrap(), 0);
        assert!(store.exists("dev", day(2025, 1, 4)));
    }

    #[test]
    fn quarantine_renames_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(tmp.path());
        let date = day(2025, 1, 1);

        let mut h = store.reserve("dev", date).unwrap();
        h.write_chunk(b"not a zone").unwrap();
        h.commit(None, 0).unwrap();

        let bad = store.quarantine("dev", date).unwrap();
        assert!(bad.to_string_lossy().ends_with(".bad"));
        assert!(!store.exists("dev", date));
    }
}
