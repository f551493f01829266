//! # zonedrop
//!
//! **Daily dropped-domain tracking over ICANN CZDS zone files.**
//!
//! zonedrop downloads each tracked TLD's authoritative zone file from the
//! Centralized Zone Data Service every day, extracts the set of
//! second-level labels, and diffs it against the previous day's set.
//! Labels present yesterday and absent today are recorded as *drops*,
//! enriched with derived metadata (length, charset class, quality score),
//! and evaluated against user watchlists that can fan out notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌─────────┐   ┌──────────┐
//! │ Scheduler │──▶│ CZDS fetch │──▶│  Parser  │──▶│ Detector │
//! │ cron + W  │   │ ZoneStore  │   │ SLD set  │   │ prev\today│
//! └───────────┘   └────────────┘   └─────────┘   └────┬─────┘
//!                                                     │
//!                                  ┌──────────────────┤
//!                                  ▼                  ▼
//!                            ┌──────────┐      ┌───────────┐
//!                            │ Persister│─────▶│ Watchlists│──▶ notifications
//!                            │  SQLite  │      │  matcher  │
//!                            └──────────┘      └───────────┘
//! ```
//!
//! ## Data Flow (one TLD, one day)
//!
//! 1. The **scheduler** ([`scheduler`]) fires the TLD's cron job, acquires
//!    the single-flight lease, and hands a ticket to a worker.
//! 2. The **CZDS client** ([`czds`]) authenticates (cached bearer token),
//!    resolves the zone URL, and streams the body into a reserved
//!    **zone store** ([`store`]) handle — committed atomically.
//! 3. The **parser** ([`parser`]) extracts the unique lowercased SLD set,
//!    spilling to sorted disk runs past the memory budget.
//! 4. The **detector** ([`detect`]) computes `yesterday \ today` and
//!    derives per-drop metadata, scoring via [`quality`].
//! 5. The **persister** ([`persist`]) writes drops idempotently and
//!    updates the TLD's last-import markers.
//! 6. The **watchlist matcher** ([`watchlist`]) evaluates new drops
//!    against compiled user patterns and enqueues notifications
//!    ([`notify`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`models`] | Core data types: TLDs, snapshots, drops, watchlists, jobs |
//! | [`error`] | Failure taxonomy driving retry policy and exit codes |
//! | [`store`] | Atomic filesystem snapshot store with gzip transparency |
//! | [`czds`] | CZDS API client: auth, catalog, resumable downloads |
//! | [`parser`] | Streaming zone parser with external-sort dedup |
//! | [`detect`] | Adjacent-day set difference and metadata derivation |
//! | [`persist`] | Idempotent batched drop writes |
//! | [`quality`] | Pluggable label quality scoring |
//! | [`watchlist`] | Compiled pattern matching over fresh drops |
//! | [`notify`] | Notification queue sink |
//! | [`ingest`] | Per-(TLD, date) cycle orchestration |
//! | [`scheduler`] | Cron dispatch, worker pool, leases, job runs |
//! | [`query`] | Drop read API with filters and pagination |
//! | [`admin`] | TLD and job CRUD |
//! | [`server`] | Axum JSON API for the web/admin collaborators |
//! | [`progress`] | Stderr progress reporting for interactive runs |
//! | [`db`] / [`migrate`] | SQLite pool and idempotent schema |

pub mod admin;
pub mod config;
pub mod czds;
pub mod db;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod parser;
pub mod persist;
pub mod progress;
pub mod quality;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod watchlist;
