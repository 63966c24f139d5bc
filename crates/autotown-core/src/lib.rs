//! # Autotown Core
//!
//! Runtime-agnostic logic for Autotown: telemetry models, the gzip/JSON wire
//! codec, the key-value store / work queue / cache ports, and the batch
//! rollup pipeline that runs over them.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concurrency inside
//! an invocation is expressed with `futures` combinators so any executor can
//! drive it.
//!
//! ## Pipeline
//!
//! ```text
//!  trigger ──▶ paginate ──▶ dispatch ──▶ [map2] ──▶ stage handler
//!                 │  ▲                                  │
//!                 ▼  │ cursor                           ▼
//!               [map]                      sighting ──▶ merge ──▶ FoundController
//!                                                                     │
//!                                          counter ◀── paginate ◀─────┘
//!                                             │
//!                                             ▼
//!                                        DailyCounts
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Keys, stored entities, envelopes and sightings |
//! | [`codec`] | Opportunistic gzip and key/envelope payload encoding |
//! | [`store`] | `KeyValueStore` port, transactions, in-memory backend |
//! | [`queue`] | `WorkQueue` port and in-memory backend |
//! | [`cache`] | `Cache` port and in-memory backend |
//! | [`context`] | `Services` application context and batch settings |
//! | [`backpressure`] | Queue-depth admission control |
//! | [`paginate`] | Resumable cursor paginator |
//! | [`dispatch`] | Chunked, concurrent task fan-out |
//! | [`destroy`] | Allow-listed bulk deletes |
//! | [`sighting`] | Usage payload → board sightings |
//! | [`merge`] | Identity merge engine |
//! | [`counter`] | Idempotent daily counter |
//! | [`recent`] | Rolling recent-usage window |
//! | [`summary`] | Usage rollups by OS, board, country and version |
//! | [`stages`] | Queue task handlers wiring the stages together |

pub mod backpressure;
pub mod cache;
pub mod codec;
pub mod context;
pub mod counter;
pub mod destroy;
pub mod dispatch;
pub mod error;
pub mod merge;
pub mod models;
pub mod paginate;
pub mod queue;
pub mod recent;
pub mod sighting;
pub mod stages;
pub mod store;
pub mod summary;

pub use context::{BatchSettings, QueueNames, Services};
pub use error::PipelineError;
pub use models::Key;
