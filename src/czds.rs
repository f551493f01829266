//! ICANN CZDS API client.
//!
//! Authenticated access to the zone catalog and per-zone files, per the
//! CZDS REST API:
//!
//! - `POST <auth_url>` with `{username, password}` → `{accessToken}` (a JWT;
//!   expiry read from its `exp` claim without signature verification,
//!   falling back to 24 hours).
//! - `GET <base_url>/czds/downloads/links` with bearer → JSON array of zone
//!   URLs; the TLD is the final path segment minus `.zone[.gz]`.
//! - `HEAD <zone_url>` → size and cache validators.
//! - `GET <zone_url>` → zone body, usually gzip, streamed to a store handle.
//!
//! # Token cache
//!
//! The session token is a process-wide cached value behind a
//! `tokio::sync::Mutex`; a worker observing expiry (or a 401) triggers at
//! most one concurrent refresh while the others await the result.
//!
//! # Download resilience
//!
//! Network errors, 5xx, 408 and 429 retry with exponential backoff (base
//! 2 s, cap 5 min, jitter), bounded by `max_retries`. Each chunk read is
//! bounded by the inactivity timeout. When the server advertises
//! `Accept-Ranges: bytes` an interrupted download resumes with a `Range`
//! request; if the validators (`ETag`/`Last-Modified`) changed, the partial
//! file is discarded and the download restarts. Response bytes flow through
//! a bounded channel to a blocking disk writer, so a slow disk slows the
//! network instead of growing memory.

use anyhow::anyhow;
use base64::Engine;
use chrono::Utc;
use rand::Rng;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::CzdsConfig;
use crate::error::CycleError;
use crate::store::SnapshotHandle;

const USER_AGENT: &str = concat!("zonedrop/", env!("CARGO_PKG_VERSION"), " (CZDS client)");

/// Refresh the token this many seconds before its actual expiry.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 300;

/// One authorized zone from the catalog.
#[derive(Debug, Clone)]
pub struct ZoneLink {
    pub tld: String,
    pub url: String,
}

/// HEAD metadata for a zone file.
#[derive(Debug, Clone, Default)]
pub struct ZoneHead {
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub accept_ranges: bool,
}

/// Bytes transferred by one `download_zone` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStats {
    pub bytes_downloaded: u64,
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

pub struct CzdsClient {
    http: reqwest::Client,
    config: CzdsConfig,
    token: Mutex<Option<CachedToken>>,
}

impl CzdsClient {
    pub fn new(config: CzdsConfig) -> Result<Self, CycleError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CycleError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    /// A valid bearer token, re-authenticating when the cached one is
    /// missing or within the expiry buffer. The mutex is held across the
    /// refresh so contending workers perform exactly one re-auth.
    pub async fn bearer(&self) -> Result<String, CycleError> {
        let mut guard = self.token.lock().await;
        let now = Utc::now().timestamp();
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - TOKEN_EXPIRY_BUFFER_SECS > now {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.authenticate().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next call re-authenticates. Used after
    /// an observed 401.
    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    /// POST credentials to the auth endpoint and return a fresh token.
    async fn authenticate(&self) -> Result<CachedToken, CycleError> {
        let (username, password) = self
            .config
            .credentials()
            .map_err(|e| CycleError::Config(e.to_string()))?;

        let resp = self
            .http
            .post(&self.config.auth_url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| CycleError::Transient(anyhow!("CZDS authentication failed: {}", e)))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(CycleError::Fatal(anyhow!(
                "invalid CZDS credentials (HTTP 401)"
            )));
        }
        if !status.is_success() {
            return Err(CycleError::from_http_status(
                status,
                "CZDS authentication failed".to_string(),
            ));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CycleError::Transient(anyhow!("bad authentication response: {}", e)))?;
        let token = body
            .get("accessToken")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CycleError::Fatal(anyhow!("no accessToken in authentication response"))
            })?
            .to_string();

        let expires_at =
            jwt_expiry(&token).unwrap_or_else(|| Utc::now().timestamp() + 24 * 3600);

        Ok(CachedToken { token, expires_at })
    }

    /// List the zone URLs this account is authorized for.
    pub async fn list_zones(&self) -> Result<Vec<ZoneLink>, CycleError> {
        let url = format!("{}/czds/downloads/links", self.config.base_url);

        for attempt in 0..2 {
            let token = self.bearer().await?;
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| CycleError::Transient(anyhow!("failed to list zones: {}", e)))?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.invalidate_token().await;
                continue;
            }
            if !status.is_success() {
                return Err(CycleError::from_http_status(
                    status,
                    "zone catalog request failed".to_string(),
                ));
            }

            let urls: Vec<String> = resp
                .json()
                .await
                .map_err(|e| CycleError::Transient(anyhow!("bad catalog response: {}", e)))?;
            return Ok(urls
                .into_iter()
                .filter_map(|url| {
                    tld_from_url(&url).map(|tld| ZoneLink { tld, url })
                })
                .collect());
        }
        unreachable!("second catalog attempt returns above");
    }

    /// Resolve the download URL for one TLD from the catalog.
    pub async fn zone_url(&self, tld: &str) -> Result<String, CycleError> {
        let tld = tld.to_ascii_lowercase();
        let zones = self.list_zones().await?;
        zones
            .into_iter()
            .find(|z| z.tld == tld)
            .map(|z| z.url)
            .ok_or_else(|| {
                CycleError::Fatal(anyhow!("no authorized zone file for TLD '{}'", tld))
            })
    }

    /// HEAD metadata for a zone URL: declared size and cache validators.
    pub async fn head_zone(&self, url: &str) -> Result<ZoneHead, CycleError> {
        for attempt in 0..2 {
            let token = self.bearer().await?;
            let resp = self
                .http
                .head(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| CycleError::Transient(anyhow!("zone HEAD failed: {}", e)))?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.invalidate_token().await;
                continue;
            }
            if !status.is_success() {
                return Err(CycleError::from_http_status(
                    status,
                    "zone HEAD request failed".to_string(),
                ));
            }

            let headers = resp.headers();
            return Ok(ZoneHead {
                size: header_str(headers, header::CONTENT_LENGTH)
                    .and_then(|v| v.parse().ok()),
                etag: header_str(headers, header::ETAG),
                last_modified: header_str(headers, header::LAST_MODIFIED),
                accept_ranges: header_str(headers, header::ACCEPT_RANGES)
                    .map(|v| v.eq_ignore_ascii_case("bytes"))
                    .unwrap_or(false),
            });
        }
        unreachable!("second HEAD attempt returns above");
    }

    /// Stream a zone body into the reserved store handle.
    ///
    /// Returns the handle (ready to commit) and transfer stats. The handle
    /// may contain resumed bytes from a previous interrupted attempt.
    /// `progress` (when set) receives the cumulative byte count every few
    /// MiB.
    pub async fn download_zone(
        &self,
        url: &str,
        head: &ZoneHead,
        mut handle: SnapshotHandle,
        cancel: &watch::Receiver<bool>,
        progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<(SnapshotHandle, DownloadStats), CycleError> {
        let mut stats = DownloadStats::default();
        let mut reauthed = false;
        let mut last_err: Option<CycleError> = None;
        // Validators observed when the partial file was started; a change
        // means the remote file rotated and the partial bytes are garbage.
        let mut validators = (head.etag.clone(), head.last_modified.clone());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = with_jitter(backoff_delay(attempt, BACKOFF_BASE_SECS, BACKOFF_CAP_SECS));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_cancelled(cancel) => return Err(CycleError::Cancelled),
                }
            }
            if *cancel.borrow() {
                return Err(CycleError::Cancelled);
            }

            let token = self.bearer().await?;
            let resume_from = handle.len();
            let mut req = self.http.get(url).bearer_auth(&token);
            if resume_from > 0 && head.accept_ranges {
                req = req.header(header::RANGE, format!("bytes={}-", resume_from));
            } else if resume_from > 0 {
                handle.truncate().map_err(CycleError::from_io)?;
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(CycleError::Transient(anyhow!("zone fetch failed: {}", e)));
                    continue;
                }
            };

            let status = resp.status();
            match status.as_u16() {
                200 => {
                    // Full body: the server ignored (or was not sent) the
                    // range, so any partial bytes start over.
                    if handle.len() > 0 {
                        handle.truncate().map_err(CycleError::from_io)?;
                    }
                }
                206 => {
                    let current = (
                        header_str(resp.headers(), header::ETAG),
                        header_str(resp.headers(), header::LAST_MODIFIED),
                    );
                    if validators_changed(&validators, &current) {
                        handle.truncate().map_err(CycleError::from_io)?;
                        validators = current;
                        last_err = Some(CycleError::Transient(anyhow!(
                            "zone file changed during resumption"
                        )));
                        continue;
                    }
                }
                401 if !reauthed => {
                    reauthed = true;
                    self.invalidate_token().await;
                    last_err = Some(CycleError::Transient(anyhow!(
                        "bearer token rejected, re-authenticating"
                    )));
                    continue;
                }
                _ => {
                    let err =
                        CycleError::from_http_status(status, "zone fetch failed".to_string());
                    if err.is_retryable() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }

            match self
                .stream_body(resp, handle, cancel, &mut stats, progress)
                .await
            {
                StreamEnd::Done(done) => return Ok((done, stats)),
                StreamEnd::Interrupted(returned, err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    handle = returned;
                    last_err = Some(err);
                }
                // The writer consumed the handle and failed; the attempt
                // cannot resume without a new reservation.
                StreamEnd::WriterFailed(err) => return Err(err),
            }
        }

        Err(last_err
            .unwrap_or_else(|| CycleError::Transient(anyhow!("zone download failed after retries"))))
    }

    /// Pump one response body through the bounded channel into the handle's
    /// blocking writer. On interruption the handle comes back for the retry
    /// loop to resume.
    async fn stream_body(
        &self,
        mut resp: reqwest::Response,
        handle: SnapshotHandle,
        cancel: &watch::Receiver<bool>,
        stats: &mut DownloadStats,
        progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> StreamEnd {
        // A few MiB of buffered chunks at most: slow disks throttle the
        // socket rather than memory.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(8);

        let writer = tokio::task::spawn_blocking(move || -> Result<SnapshotHandle, CycleError> {
            let mut handle = handle;
            while let Some(chunk) = rx.blocking_recv() {
                handle.write_chunk(&chunk).map_err(CycleError::from_io)?;
            }
            Ok(handle)
        });

        let inactivity = Duration::from_secs(self.config.inactivity_timeout_secs);
        let mut pump_err: Option<CycleError> = None;
        // Report roughly every 8 MiB, not every chunk.
        let mut next_report = 0u64;

        loop {
            if *cancel.borrow() {
                pump_err = Some(CycleError::Cancelled);
                break;
            }
            let chunk = match tokio::time::timeout(inactivity, resp.chunk()).await {
                Err(_) => {
                    pump_err = Some(CycleError::Transient(anyhow!(
                        "no bytes received for {}s",
                        inactivity.as_secs()
                    )));
                    break;
                }
                Ok(Err(e)) => {
                    pump_err = Some(CycleError::Transient(anyhow!("body read failed: {}", e)));
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };
            stats.bytes_downloaded += chunk.len() as u64;
            if let Some(report) = progress {
                if stats.bytes_downloaded >= next_report {
                    report(stats.bytes_downloaded);
                    next_report = stats.bytes_downloaded + 8 * 1024 * 1024;
                }
            }
            if tx.send(chunk).await.is_err() {
                // Writer died; its error surfaces below.
                break;
            }
        }
        drop(tx);

        let handle = match writer.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(write_err)) => return StreamEnd::WriterFailed(write_err),
            Err(join_err) => {
                return StreamEnd::WriterFailed(CycleError::Fatal(anyhow!(
                    "disk writer panicked: {}",
                    join_err
                )))
            }
        };

        match pump_err {
            None => StreamEnd::Done(handle),
            Some(err) => StreamEnd::Interrupted(handle, err),
        }
    }
}

/// How one streaming attempt ended.
enum StreamEnd {
    /// Body fully received; handle is ready to commit.
    Done(SnapshotHandle),
    /// Transfer broke partway; the handle keeps its bytes for resumption.
    Interrupted(SnapshotHandle, CycleError),
    /// The disk writer itself failed; the handle is gone with it.
    WriterFailed(CycleError),
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn validators_changed(
    original: &(Option<String>, Option<String>),
    current: &(Option<String>, Option<String>),
) -> bool {
    match (&original.0, &current.0) {
        (Some(a), Some(b)) => return a != b,
        _ => {}
    }
    match (&original.1, &current.1) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// TLD encoded in a catalog URL: the final path segment without its
/// `.zone[.gz]` suffix.
pub fn tld_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    let name = segment
        .strip_suffix(".zone.gz")
        .or_else(|| segment.strip_suffix(".zone"))?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_ascii_lowercase())
    }
}

/// Unverified JWT `exp` claim, when the token looks like a JWT.
fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

/// Exponential backoff for attempt `n` (1-based): `base * 2^(n-1)`, capped.
/// Monotonically non-decreasing in `n`.
pub fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let secs = base_secs.saturating_mul(1u64 << exp).min(cap_secs);
    Duration::from_secs(secs)
}

/// Add up to 25% random jitter so synchronized workers spread out.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = delay.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

async fn wait_cancelled(cancel: &watch::Receiver<bool>) {
    let mut rx = cancel.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone; nothing will ever cancel us.
            std::future::pending::<()>().await;
        }
    }
}
