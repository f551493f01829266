//! Cycle progress for interactive runs.
//!
//! A zone ingest can sit inside a multi-GB download or a hundred-million
//! line parse for minutes; the progress sink keeps stderr informative
//! while stdout stays parseable for scripts. Two phases are reported:
//! the download (cumulative bytes, with a percentage when the server
//! declared a Content-Length) and the parse (lines consumed per day).

use serde::Serialize;
use std::io::Write;

/// A single progress event for one cycle.
#[derive(Clone, Debug)]
pub enum CycleEvent {
    /// Download in flight; `total` is the declared Content-Length, if any.
    Downloading {
        tld: String,
        bytes: u64,
        total: Option<u64>,
    },
    /// One day's snapshot finished parsing.
    Parsing { tld: String, lines: u64 },
}

/// Sink for cycle progress events.
pub trait CycleProgress: Send + Sync {
    fn report(&self, event: CycleEvent);
}

/// How the CLI reports progress: silent, human-readable lines, or one
/// JSON object per line. The mode doubles as the sink, so callers hand it
/// straight to the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }
}

impl CycleProgress for ProgressMode {
    fn report(&self, event: CycleEvent) {
        let line = match self {
            ProgressMode::Off => return,
            ProgressMode::Human => human_line(&event),
            ProgressMode::Json => match serde_json::to_string(&JsonRecord::from(&event)) {
                Ok(json) => json,
                Err(_) => return,
            },
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

fn human_line(event: &CycleEvent) -> String {
    match event {
        CycleEvent::Downloading {
            tld,
            bytes,
            total: Some(total),
        } if *total > 0 => {
            let pct = (*bytes as f64 / *total as f64 * 100.0).min(100.0);
            format!(
                "{}: downloaded {} of {} ({:.0}%)",
                tld,
                human_bytes(*bytes),
                human_bytes(*total),
                pct
            )
        }
        CycleEvent::Downloading { tld, bytes, .. } => {
            format!("{}: downloaded {}", tld, human_bytes(*bytes))
        }
        CycleEvent::Parsing { tld, lines } => {
            format!("{}: parsed {} zone lines", tld, human_count(*lines))
        }
    }
}

/// Flat wire shape for the JSON stream, one object per event.
#[derive(Serialize)]
struct JsonRecord<'a> {
    event: &'static str,
    tld: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lines: Option<u64>,
}

impl<'a> From<&'a CycleEvent> for JsonRecord<'a> {
    fn from(event: &'a CycleEvent) -> Self {
        match event {
            CycleEvent::Downloading { tld, bytes, total } => JsonRecord {
                event: "download",
                tld,
                bytes: Some(*bytes),
                total: *total,
                lines: None,
            },
            CycleEvent::Parsing { tld, lines } => JsonRecord {
                event: "parse",
                tld,
                bytes: None,
                total: None,
                lines: Some(*lines),
            },
        }
    }
}

/// `1.5 KiB`, `42.0 MiB`, `3.1 GiB`; exact below one KiB.
fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Zone line counts: exact up to five digits, then `k`/`M`.
fn human_count(n: u64) -> String {
    if n >= 10_000_000 {
        format!("{:.1}M", n as f64 / 1e6)
    } else if n >= 100_000 {
        format!("{:.0}k", n as f64 / 1e3)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(44_040_192), "42.0 MiB");
        assert_eq!(human_bytes(3_328_599_655), "3.1 GiB");
    }

    #[test]
    fn counts_stay_exact_until_large() {
        assert_eq!(human_count(0), "0");
        assert_eq!(human_count(99_999), "99999");
        assert_eq!(human_count(2_500_000), "2500k");
        assert_eq!(human_count(104_000_000), "104.0M");
    }

    #[test]
    fn download_line_shows_percentage_when_total_known() {
        let line = human_line(&CycleEvent::Downloading {
            tld: "dev".to_string(),
            bytes: 52_428_800,
            total: Some(104_857_600),
        });
        assert_eq!(line, "dev: downloaded 50.0 MiB of 100.0 MiB (50%)");

        let line = human_line(&CycleEvent::Downloading {
            tld: "dev".to_string(),
            bytes: 1024,
            total: None,
        });
        assert_eq!(line, "dev: downloaded 1.0 KiB");
    }

    #[test]
    fn parse_line_counts_lines() {
        let line = human_line(&CycleEvent::Parsing {
            tld: "org".to_string(),
            lines: 250_000,
        });
        assert_eq!(line, "org: parsed 250k zone lines");
    }

    #[test]
    fn json_records_are_flat_per_phase() {
        let json = serde_json::to_string(&JsonRecord::from(&CycleEvent::Downloading {
            tld: "dev".to_string(),
            bytes: 10,
            total: Some(20),
        }))
        .unwrap();
        assert_eq!(json, r#"{"event":"download","tld":"dev","bytes":10,"total":20}"#);

        let json = serde_json::to_string(&JsonRecord::from(&CycleEvent::Parsing {
            tld: "dev".to_string(),
            lines: 5,
        }))
        .unwrap();
        assert_eq!(json, r#"{"event":"parse","tld":"dev","lines":5}"#);
    }

    #[test]
    fn off_mode_never_panics() {
        ProgressMode::Off.report(CycleEvent::Parsing {
            tld: "dev".to_string(),
            lines: 1,
        });
    }
}
