//! Pluggable label quality scoring.
//!
//! The detector treats the scorer as an opaque function: `score(label, tld)`
//! returns `Some(0..=100)` or `None`, must be pure, and must stay cheap
//! (it runs once per detected drop). Scores are snapshots taken at
//! detection time and are never back-filled.
//!
//! # Providers
//!
//! | Config value | Implementation |
//! |--------------|----------------|
//! | `"heuristic"` | [`HeuristicScorer`] — length, charset, pattern, TLD weight, dictionary hits |
//! | `"disabled"` | no scorer; drops persist with a NULL score |

use std::collections::HashSet;
use std::sync::OnceLock;

use crate::config::QualityConfig;

/// Scores a label's commercial/aesthetic value on a 0–100 scale.
pub trait QualityScorer: Send + Sync {
    /// `None` means "no opinion"; the drop is stored with a NULL score.
    fn score(&self, label: &str, tld: &str) -> Option<i64>;
}

/// Instantiate the configured scorer, or `None` when scoring is disabled.
pub fn create_scorer(config: &QualityConfig) -> Option<Box<dyn QualityScorer>> {
    match config.provider.as_str() {
        "heuristic" => Some(Box::new(HeuristicScorer)),
        _ => None,
    }
}

/// Brandable/common words that raise a label's score.
const COMMON_WORDS: &[&str] = &[
    // Short words (2-4 letters)
    "app", "web", "net", "dev", "api", "hub", "lab", "box", "bot", "pro", "max", "top", "new",
    "hot", "big", "one", "all", "get", "buy", "pay", "run", "fly", "go", "do", "be", "my", "we",
    "up", "on", "in", "to", "ai", "io", "co", "tv", "me", "us", "uk", "eu", "la", "ny",
    // Tech words
    "cloud", "cyber", "pixel", "smart", "swift", "rapid", "ultra", "micro", "super", "hyper",
    "alpha", "beta", "delta", "gamma", "omega", "prime", "elite", "boost", "spark", "flash",
    "blaze", "storm", "force", "power", "logic", "nexus", "pulse", "vibe", "flux", "core",
    "edge", "sync", "tech", "data", "code", "hack", "byte", "link", "node", "mesh",
    // Business words
    "trade", "market", "store", "shop", "deal", "sale", "stock", "fund", "money", "cash", "gold",
    "bank", "trust", "legal", "audit", "brand", "media", "press", "news", "blog", "wiki", "forum",
    "group", "team",
    // Creative words
    "design", "style", "trend", "craft", "create", "build", "make", "form", "art", "music",
    "video", "photo", "game", "play", "fun", "cool",
    // Action words
    "find", "search", "track", "watch", "learn", "teach", "guide", "help", "start", "launch",
    "grow", "scale", "level", "drive", "move",
    // Descriptive words
    "fast", "quick", "easy", "simple", "clean", "clear", "fresh", "pure", "safe", "secure",
    "free", "open", "direct", "instant", "global", "local",
    // Domain-specific
    "hosting", "domain", "server", "email", "mail", "inbox", "send", "chat", "call", "meet",
    "zoom", "live", "stream", "cast", "feed", "post",
];

/// Per-TLD value weights; unlisted TLDs default to 3.
const TLD_WEIGHTS: &[(&str, i64)] = &[
    ("com", 15),
    ("net", 10),
    ("org", 10),
    ("io", 12),
    ("co", 10),
    ("dev", 14),
    ("app", 14),
    ("ai", 15),
    ("tech", 8),
    ("pro", 8),
    ("me", 7),
    ("tv", 7),
    ("info", 5),
    ("biz", 5),
    ("name", 4),
    ("blog", 6),
    ("shop", 7),
    ("store", 7),
    ("site", 5),
    ("online", 5),
    ("cloud", 8),
    ("digital", 6),
    ("media", 6),
    ("news", 6),
    ("live", 6),
];

fn word_set() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| COMMON_WORDS.iter().copied().collect())
}

/// Heuristic scorer: sums component scores for length (0–30), charset
/// (0–20), pattern (0–15), TLD weight (0–15), and dictionary word (0–20),
/// clamped to 0..=100.
pub struct HeuristicScorer;

impl QualityScorer for HeuristicScorer {
    fn score(&self, label: &str, tld: &str) -> Option<i64> {
        let label = label.trim().to_ascii_lowercase();
        if label.is_empty() {
            return None;
        }
        let tld = tld.trim().trim_start_matches('.').to_ascii_lowercase();

        let total = length_score(label.chars().count())
            + charset_score(&label)
            + pattern_score(&label)
            + tld_score(&tld)
            + word_score(&label);

        Some(total.clamp(0, 100))
    }
}

/// Shorter is more valuable.
fn length_score(length: usize) -> i64 {
    match length {
        0..=2 => 30,
        3 => 28,
        4 => 25,
        5 => 20,
        6 => 15,
        7..=8 => 10,
        9..=10 => 5,
        11..=15 => 2,
        _ => 0,
    }
}

fn charset_score(label: &str) -> i64 {
    let all_alpha = label.bytes().all(|b| b.is_ascii_lowercase());
    if all_alpha {
        return 20;
    }
    let all_digit = label.bytes().all(|b| b.is_ascii_digit());
    if all_digit {
        return if label.len() <= 4 { 15 } else { 8 };
    }
    let alnum = label.bytes().all(|b| b.is_ascii_alphanumeric());
    if alnum {
        let bytes = label.as_bytes();
        // Trailing digit (app2, web3) reads better than a leading one.
        if bytes[bytes.len() - 1].is_ascii_digit()
            && bytes[..bytes.len() - 1].iter().all(|b| b.is_ascii_lowercase())
        {
            return 15;
        }
        if bytes[0].is_ascii_digit() {
            return 8;
        }
        return 10;
    }
    if label.contains('-') {
        let single_middle_hyphen = label.matches('-').count() == 1
            && !label.starts_with('-')
            && !label.ends_with('-');
        return if single_middle_hyphen { 5 } else { 0 };
    }
    5
}

fn pattern_score(label: &str) -> i64 {
    let mut score = 0i64;

    if is_pronounceable(label) {
        score += 8;
    }

    const SUFFIXES: &[&str] = &["ly", "ify", "fy", "er", "io", "ia", "eo", "it", "ix", "ex", "ox"];
    if SUFFIXES
        .iter()
        .any(|s| label.ends_with(s) && label.len() > s.len() + 1)
    {
        score += 3;
    }

    const PREFIXES: &[&str] = &["get", "my", "the", "go", "try", "use", "be", "we", "i"];
    if PREFIXES
        .iter()
        .any(|p| label.starts_with(p) && label.len() > p.len() + 1)
    {
        score += 3;
    }

    if has_triple_repeat(label) {
        score -= 5;
    }

    score.clamp(0, 15)
}

/// Has a vowel and no run of more than four consonants.
fn is_pronounceable(label: &str) -> bool {
    let mut has_vowel = false;
    let mut consonant_run = 0usize;
    let mut max_run = 0usize;
    for b in label.bytes() {
        if matches!(b, b'a' | b'e' | b'i' | b'o' | b'u') {
            has_vowel = true;
            consonant_run = 0;
        } else if b.is_ascii_lowercase() {
            consonant_run += 1;
            max_run = max_run.max(consonant_run);
        } else {
            consonant_run = 0;
        }
    }
    has_vowel && max_run <= 4
}

/// Three or more of the same character in a row.
fn has_triple_repeat(label: &str) -> bool {
    let bytes = label.as_bytes();
    bytes.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

fn tld_score(tld: &str) -> i64 {
    TLD_WEIGHTS
        .iter()
        .find(|(name, _)| *name == tld)
        .map(|(_, w)| *w)
        .unwrap_or(3)
}

fn word_score(label: &str) -> i64 {
    let words = word_set();
    if words.contains(label) {
        return 20;
    }

    for w in words.iter() {
        if w.len() >= 3 && label.contains(w) {
            if label.starts_with(w) || label.ends_with(w) {
                return 12;
            }
            return 8;
        }
    }

    // Compounds of short words (e.g. two 2-letter words) that the
    // substring pass above cannot see.
    for w in words.iter() {
        if w.len() >= 2 && label.starts_with(w) && words.contains(&label[w.len()..]) {
            return 15;
        }
    }

    0
}
