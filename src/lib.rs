//! # Bulkport
//!
//! Streaming bulk import and export of users, articles and comments between
//! CSV/NDJSON files and SQLite.
//!
//! Imports run as background jobs: the source is parsed record by record,
//! each record is validated and normalized, valid records are upserted in
//! batches, and a reconciliation pass removes rows whose references do not
//! resolve. Every failure is reported against its source row without
//! aborting the job. Exports either stream a whole table or run as filtered
//! jobs that write a downloadable file.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────┐   ┌──────────┐
//! │  Sources  │──▶│  Import pipeline      │──▶│  SQLite  │
//! │ file/URL  │   │ parse▸validate▸upsert │   │  WAL     │
//! └───────────┘   └──────────────────────┘   └────┬─────┘
//!                                                 │
//!                      ┌──────────────────────────┤
//!                      ▼                          ▼
//!                 ┌──────────┐              ┌──────────┐
//!                 │   CLI    │              │   HTTP   │
//!                 │  (bulk)  │              │  (axum)  │
//!                 └──────────┘              └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bulk init
//! bulk import users.csv --resource users --key first-load
//! bulk export --resource users --format ndjson > users.ndjson
//! bulk serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Shared pool, config and job tracker |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`parse`] | Streaming CSV/NDJSON record parsing |
//! | [`validate`] | Field rules shared by all kinds |
//! | [`normalize`] | Defaults, coercion and identity |
//! | [`resource`] | Per-kind validation, mapping and fields |
//! | [`upsert`] | Batched conflict-resolving writes |
//! | [`reconcile`] | Post-import referential integrity |
//! | [`jobs`] | Job records, transitions and supervision |
//! | [`source`] | Import sources and staging |
//! | [`import`] | Import job orchestration |
//! | [`export`] | Streaming and filtered exports |
//! | [`server`] | HTTP API |
//! | [`progress`] | CLI progress reporting |
//! | [`stats`] | Store overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod jobs;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parse;
pub mod progress;
pub mod reconcile;
pub mod resource;
pub mod server;
pub mod source;
pub mod stats;
pub mod upsert;
pub mod validate;
