//! TOML configuration parsing and validation.
//!
//! All settings live in a TOML file (default: `config/zonedrop.toml`);
//! deployment secrets and paths can be overridden through environment
//! variables so containers never need a writable config file:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `ZONEDROP_DATA_DIR` | `[storage].data_dir` |
//! | `ZONEDROP_DB_PATH` | `[db].path` |
//! | `CZDS_USERNAME` / `CZDS_PASSWORD` | `[czds].username` / `.password` |
//! | `CZDS_AUTH_URL` | `[czds].auth_url` |
//! | `CZDS_BASE_URL` | `[czds].base_url` |
//! | `CZDS_DOWNLOAD_BASE_URL` | `[czds].download_base_url` |
//! | `ZONEDROP_WORKERS` | `[scheduler].workers` |
//! | `ZONEDROP_CATCHUP_HORIZON` | `[scheduler].catchup_horizon_days` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub czds: CzdsConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory; snapshots live under `<data_dir>/zones/<tld>/`.
    pub data_dir: PathBuf,
    /// Snapshots kept per TLD by `prune`. Never below 2 (adjacent-day diff).
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
}

fn default_keep_snapshots() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct CzdsConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Per-byte inactivity timeout while streaming a zone body.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl Default for CzdsConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            auth_url: default_auth_url(),
            base_url: default_base_url(),
            download_base_url: default_download_base_url(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
        }
    }
}

fn default_auth_url() -> String {
    "https://account-api.icann.org/api/authenticate".to_string()
}
fn default_base_url() -> String {
    "https://czds-api.icann.org".to_string()
}
fn default_download_base_url() -> String {
    "https://czds-download-api.icann.org".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_inactivity_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    /// Unique labels held in memory before spilling to sorted runs on disk.
    #[serde(default = "default_label_budget")]
    pub label_budget: usize,
    /// Cancellation checkpoint interval, in lines.
    #[serde(default = "default_checkpoint_lines")]
    pub checkpoint_lines: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            label_budget: default_label_budget(),
            checkpoint_lines: default_checkpoint_lines(),
        }
    }
}

fn default_label_budget() -> usize {
    20_000_000
}
fn default_checkpoint_lines() -> u64 {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    /// `"heuristic"` or `"disabled"`.
    #[serde(default = "default_quality_provider")]
    pub provider: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            provider: default_quality_provider(),
        }
    }
}

fn default_quality_provider() -> String {
    "heuristic".to_string()
}

impl QualityConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Parallel cycle workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Missed daily cycles re-enqueued at startup, oldest first.
    #[serde(default = "default_catchup_horizon")]
    pub catchup_horizon_days: u32,
    /// Hard wall-clock timeout for one cycle.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "default_job_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt, capped at one hour.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            catchup_horizon_days: default_catchup_horizon(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            max_retries: default_job_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_catchup_horizon() -> u32 {
    7
}
fn default_cycle_timeout_secs() -> u64 {
    7200
}
fn default_job_max_retries() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("ZONEDROP_DATA_DIR") {
        config.storage.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("ZONEDROP_DB_PATH") {
        config.db.path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CZDS_USERNAME") {
        config.czds.username = Some(v);
    }
    if let Ok(v) = std::env::var("CZDS_PASSWORD") {
        config.czds.password = Some(v);
    }
    if let Ok(v) = std::env::var("CZDS_AUTH_URL") {
        config.czds.auth_url = v;
    }
    if let Ok(v) = std::env::var("CZDS_BASE_URL") {
        config.czds.base_url = v;
    }
    if let Ok(v) = std::env::var("CZDS_DOWNLOAD_BASE_URL") {
        config.czds.download_base_url = v;
    }
    if let Ok(v) = std::env::var("ZONEDROP_WORKERS") {
        if let Ok(n) = v.parse() {
            config.scheduler.workers = n;
        }
    }
    if let Ok(v) = std::env::var("ZONEDROP_CATCHUP_HORIZON") {
        if let Ok(n) = v.parse() {
            config.scheduler.catchup_horizon_days = n;
        }
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.keep_snapshots < 2 {
        anyhow::bail!("storage.keep_snapshots must be >= 2 (adjacent-day diff needs both days)");
    }
    if config.scheduler.workers == 0 {
        anyhow::bail!("scheduler.workers must be >= 1");
    }
    if config.scheduler.catchup_horizon_days == 0 {
        anyhow::bail!("scheduler.catchup_horizon_days must be >= 1");
    }
    if config.parser.label_budget == 0 {
        anyhow::bail!("parser.label_budget must be > 0");
    }
    match config.quality.provider.as_str() {
        "heuristic" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown quality provider: '{}'. Must be heuristic or disabled.",
            other
        ),
    }
    Ok(())
}

impl CzdsConfig {
    /// Credentials, or a config error naming the missing variable.
    pub fn credentials(&self) -> Result<(String, String)> {
        let user = self
            .username
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CZDS_USERNAME not configured"))?;
        let pass = self
            .password
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CZDS_PASSWORD not configured"))?;
        Ok((user, pass))
    }
}
