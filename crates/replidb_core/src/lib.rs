//! # replidb Core
//!
//! Durability and consistency engine for replidb.
//!
//! This crate provides:
//! - LSNs and the write-ahead log, split into segment files
//! - A logger thread with `Sync`, `Async` and `PseudoSync` durability
//! - Crash recovery that replays the log from the oldest checkpoint mark
//! - A checkpoint coordinator that bounds recovery and reclaims segments
//! - A worker pool sequencing mutations per database
//! - Database and snapshot managers on top of an [`IndexStore`]
//!
//! ## Lifecycle
//!
//! ```text
//! open: lock dir → load registry + checkpoints → replay → start logger,
//!       workers, checkpoint coordinator
//! shutdown: stop accepting → drain workers → drain logger →
//!           stop checkpoint coordinator → release stores
//! ```
//!
//! [`IndexStore`]: replidb_storage::IndexStore

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod checkpoint;
mod config;
mod database;
mod dir;
mod engine;
mod error;
mod gate;
mod insert;
mod recovery;
mod registry;
mod snapshot;
mod types;
pub mod wal;
mod worker;

pub use checkpoint::{CheckpointFile, CheckpointReport, CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use config::{Config, SyncMode};
pub use database::{Database, DatabaseManager, MAX_DATABASE_NAME_LEN};
pub use dir::EngineDir;
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use gate::{ApplyGate, GatePause, GateTicket};
pub use insert::{InsertRecord, InsertRecordGroup};
pub use recovery::{recovery_start, LogReplayer, NullSink, ReplayOutcome, ReplaySink};
pub use registry::{DatabaseRecord, DatabaseRegistry, REGISTRY_MAGIC, REGISTRY_VERSION};
pub use snapshot::{
    PersistentSnapshot, SnapshotConfig, SnapshotManager, SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};
pub use types::{DatabaseId, Lsn};
pub use worker::{PendingResult, WorkerPool};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
