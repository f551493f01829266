//! JSON HTTP API for the web/admin collaborators.
//!
//! Read access to drops, TLDs, jobs, and runs, plus idempotent admin
//! upserts. The HTML application, auth, and billing live outside this
//! crate and consume these endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/drops` | Paginated drop listing with filters |
//! | `GET`  | `/tlds` | Tracked TLDs with last-import markers |
//! | `PUT`  | `/tlds/{name}` | Idempotent TLD upsert |
//! | `POST` | `/tlds/{name}/active` | Enable/disable a TLD |
//! | `GET`  | `/jobs` | Job descriptors |
//! | `PUT`  | `/jobs` | Idempotent job upsert |
//! | `GET`  | `/runs` | Recent job runs, newest first |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown charset type" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the API is fronted by
//! the out-of-scope web layer in production.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::admin::{self, JobSpec};
use crate::config::Config;
use crate::db;
use crate::models::{CharsetType, JobKind};
use crate::query::{query_drops, DropFilter};

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
}

/// Start the JSON API server on the configured bind address.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState { pool };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/drops", get(handle_drops))
        .route("/tlds", get(handle_list_tlds))
        .route("/tlds/{name}", put(handle_upsert_tld))
        .route("/tlds/{name}/active", post(handle_tld_active))
        .route("/jobs", get(handle_list_jobs).put(handle_upsert_job))
        .route("/runs", get(handle_list_runs))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(Arc::new(state));

    let bind_addr = config.server.bind.clone();
    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct DropsParams {
    tld: Option<String>,
    date: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    min_length: Option<i64>,
    max_length: Option<i64>,
    charset: Option<String>,
    search: Option<String>,
    min_quality: Option<i64>,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}
fn default_page_size() -> i64 {
    50
}

async fn handle_drops(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DropsParams>,
) -> Result<impl IntoResponse, AppError> {
    let filter = DropFilter {
        tld: params.tld,
        date: parse_date(params.date.as_deref())?,
        date_from: parse_date(params.date_from.as_deref())?,
        date_to: parse_date(params.date_to.as_deref())?,
        min_length: params.min_length,
        max_length: params.max_length,
        charset: params
            .charset
            .as_deref()
            .map(CharsetType::from_str)
            .transpose()
            .map_err(bad_request)?,
        substring: params.search,
        min_quality: params.min_quality,
        page: params.page,
        page_size: params.page_size,
    };

    let page = query_drops(&state.pool, &filter)
        .await
        .map_err(internal)?;
    Ok(Json(page))
}

async fn handle_list_tlds(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let tlds = admin::list_tlds(&state.pool).await.map_err(internal)?;
    Ok(Json(tlds))
}

#[derive(Deserialize, Default)]
struct UpsertTldBody {
    display_name: Option<String>,
}

async fn handle_upsert_tld(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<UpsertTldBody>>,
) -> Result<impl IntoResponse, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let tld = admin::upsert_tld(&state.pool, &name, body.display_name.as_deref())
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(tld))
}

#[derive(Deserialize)]
struct TldActiveBody {
    active: bool,
}

async fn handle_tld_active(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<TldActiveBody>,
) -> Result<impl IntoResponse, AppError> {
    admin::set_tld_active(&state.pool, &name, body.active)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let jobs = admin::list_jobs(&state.pool).await.map_err(internal)?;
    Ok(Json(jobs))
}

#[derive(Deserialize)]
struct UpsertJobBody {
    tld: String,
    #[serde(default = "default_job_kind")]
    kind: String,
    schedule: Option<String>,
    timeout_secs: Option<i64>,
    max_retries: Option<i64>,
    backoff_base_secs: Option<i64>,
}

fn default_job_kind() -> String {
    "full".to_string()
}

async fn handle_upsert_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertJobBody>,
) -> Result<impl IntoResponse, AppError> {
    let kind = JobKind::from_str(&body.kind).map_err(bad_request)?;
    let spec = JobSpec {
        schedule: body.schedule,
        timeout_secs: body.timeout_secs,
        max_retries: body.max_retries,
        backoff_base_secs: body.backoff_base_secs,
    };
    let job = admin::upsert_job(&state.pool, &body.tld, kind, &spec)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct RunsParams {
    tld: Option<String>,
    #[serde(default = "default_runs_limit")]
    limit: i64,
}

fn default_runs_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct RunRow {
    id: i64,
    tld: String,
    kind: String,
    target_date: String,
    started_at: i64,
    finished_at: Option<i64>,
    outcome: String,
    stats_json: Option<String>,
    error_class: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
}

async fn handle_list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Result<impl IntoResponse, AppError> {
    let limit = params.limit.clamp(1, 500);
    let rows = match &params.tld {
        Some(tld) => {
            sqlx::query(
                "SELECT id, tld, kind, target_date, started_at, finished_at, outcome, stats_json,
                        error_class, error_message, retry_count
                 FROM job_runs WHERE tld = ? ORDER BY started_at DESC, id DESC LIMIT ?",
            )
            .bind(tld.to_ascii_lowercase())
            .bind(limit)
            .fetch_all(&state.pool)
            .await
        }
        None => {
            sqlx::query(
                "SELECT id, tld, kind, target_date, started_at, finished_at, outcome, stats_json,
                        error_class, error_message, retry_count
                 FROM job_runs ORDER BY started_at DESC, id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&state.pool)
            .await
        }
    }
    .map_err(internal)?;

    let runs: Vec<RunRow> = rows
        .into_iter()
        .map(|row| RunRow {
            id: row.get("id"),
            tld: row.get("tld"),
            kind: row.get("kind"),
            target_date: row.get("target_date"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            outcome: row.get("outcome"),
            stats_json: row.get("stats_json"),
            error_class: row.get("error_class"),
            error_message: row.get("error_message"),
            retry_count: row.get("retry_count"),
        })
        .collect();

    Ok(Json(runs))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    value
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .map_err(|_| bad_request("dates must be YYYY-MM-DD"))
}
