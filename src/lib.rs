//! # Autotown
//!
//! SQLite-backed runtime for the Autotown telemetry rollup pipeline. The
//! pipeline itself lives in `autotown-core`; this crate supplies the
//! storage, queue and cache backends, configuration, and the worker loop
//! that the `autotown` binary drives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │  ingest  │──▶│ tasks (queue) │──▶│    worker    │
//! │   map    │   │               │◀──│ stages::     │
//! └──────────┘   └───────────────┘   │   handle     │
//!                                    └──────┬───────┘
//!                                           ▼
//!                      ┌──────────────┐  ┌──────────┐
//!                      │   entities   │  │  cache   │
//!                      └──────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | `KeyValueStore` over the `entities` table |
//! | [`sqlite_queue`] | `WorkQueue` over the `tasks` table |
//! | [`sqlite_cache`] | `Cache` over the `cache` table |
//! | [`notify`] | Logging notifier |
//! | [`app`] | Builds the `Services` context |
//! | [`ingest`] | Usage submission intake |
//! | [`worker`] | Queue worker loop with retry policy |
//! | [`stats`] | Database statistics |

pub mod app;
pub mod config;
pub mod db;
pub mod ingest;
pub mod migrate;
pub mod notify;
pub mod sqlite_cache;
pub mod sqlite_queue;
pub mod sqlite_store;
pub mod stats;
pub mod worker;
