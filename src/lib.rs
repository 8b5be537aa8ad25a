//! # Index Release
//!
//! Blue-green lifecycle for a product search index.
//!
//! Every build produces a fresh, versioned set of physical resources (a
//! primary index, an autocomplete index and a synonym set) bound to one of
//! two environments. Staging is built and checked offline; promotion moves
//! the stable aliases that clients query from production's indices to
//! staging's in one atomic request, then deletes what was superseded.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Catalog   │──▶│ IndexBuilder │──▶│ SearchEngine │◀── aliases
//! │ (SQLite)  │   │ embed + bulk │   │  (REST)      │
//! └───────────┘   └──────┬───────┘   └──────────────┘
//!                        │
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//!  ┌──────────┐   ┌────────────┐   ┌────────────┐
//!  │ Indexing │   │ Promotion  │   │ Reconcile  │
//!  └────┬─────┘   └─────┬──────┘   └─────┬──────┘
//!       └──────── ReleaseService ────────┘
//!                 │            │
//!             CLI (ixr)    HTTP (axum)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`error`] | [`ReleaseError`](error::ReleaseError) taxonomy |
//! | [`environment`] | Environment rows and their guarded transitions |
//! | [`history`] | Append-only deployment history |
//! | [`task`] | Build task progress for pollers |
//! | [`guard`] | Cross-process indexing guard |
//! | [`version`] | Time-derived version tokens |
//! | [`dictionary`], [`channel`] | Dictionary entries, snapshots and delivery to search nodes |
//! | [`embedding`] | Embedding providers and the content-hash cache |
//! | [`engine_http`] | REST client for the search engine |
//! | [`catalog_sql`] | Product catalog read from SQLite |
//! | [`builder`] | Physical index creation, document loading, deletion |
//! | [`alias`] | Atomic alias repointing |
//! | [`progress`] | Progress sinks and CLI reporters |
//! | [`context`] | Shared wiring for the orchestrators |
//! | [`indexing`] | Build pipeline |
//! | [`promotion`] | Staging → production cutover |
//! | [`reconcile`] | Orphan detection and cleanup |
//! | [`service`] | Facade used by the CLI and server |
//! | [`server`] | Admin HTTP server |

pub mod alias;
pub mod builder;
pub mod catalog_sql;
pub mod channel;
pub mod config;
pub mod context;
pub mod db;
pub mod dictionary;
pub mod embedding;
pub mod engine_http;
pub mod environment;
pub mod error;
pub mod guard;
pub mod history;
pub mod indexing;
pub mod migrate;
pub mod progress;
pub mod promotion;
pub mod reconcile;
pub mod server;
pub mod service;
pub mod task;
pub mod version;
