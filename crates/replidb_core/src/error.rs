//! Error types for replidb core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in replidb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Indexed store error.
    #[error("storage error: {0}")]
    Storage(#[from] replidb_storage::StorageError),

    /// I/O error while reading or writing logs, checkpoints or metadata.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log entry could not be decoded.
    ///
    /// Fatal during recovery.
    #[error("corrupt log entry in {} at offset {offset}: {reason}", .file.display())]
    CorruptLogEntry {
        /// Segment file containing the entry.
        file: PathBuf,
        /// Byte offset of the entry within the file.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A log entry payload could not be decoded.
    #[error("malformed payload: {message}")]
    MalformedPayload {
        /// Description of the problem.
        message: String,
    },

    /// The named database does not exist.
    #[error("no such database: {name}")]
    NoSuchDatabase {
        /// Name (or `#id`) of the database.
        name: String,
    },

    /// The index does not exist in the database.
    #[error("no such index {index} in database {database} ({count} indices)")]
    NoSuchIndex {
        /// Database name.
        database: String,
        /// Requested index.
        index: usize,
        /// Number of indices in the database.
        count: usize,
    },

    /// The snapshot does not exist.
    #[error("no such snapshot {snapshot} in database {database}")]
    NoSuchSnapshot {
        /// Database name.
        database: String,
        /// Snapshot name.
        snapshot: String,
    },

    /// A database with that name already exists.
    #[error("database already exists: {name}")]
    DatabaseExists {
        /// Name of the database.
        name: String,
    },

    /// A snapshot with that name already exists.
    #[error("snapshot {snapshot} already exists in database {database}")]
    SnapshotExists {
        /// Database name.
        database: String,
        /// Snapshot name.
        snapshot: String,
    },

    /// No master can be resolved; a majority of replicas is unreachable.
    #[error("replication unavailable: {message}")]
    ReplicationUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// A forwarded call failed for a reason other than a translated domain error.
    #[error("replication failure: {message}")]
    ReplicationFailure {
        /// Description of the failure.
        message: String,
    },

    /// An administrative operation was attempted on a node that is not master.
    #[error("operation {operation} is not supported on a replica")]
    UnsupportedOnReplica {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// Base directory is already locked by another process.
    #[error("database directory locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The engine is shutting down or stopped and accepts no new operations.
    #[error("engine is shut down")]
    ShuttingDown,

    /// `restart` was called on an engine that was not stopped.
    #[error("engine must be stopped before it can be restarted")]
    NotStopped,

    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread: {message}")]
    SpawnFailed {
        /// Thread name.
        name: String,
        /// OS error message.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt log entry error.
    pub fn corrupt_log_entry(file: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptLogEntry {
            file: file.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a malformed payload error.
    pub fn malformed_payload(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    /// Creates a no such database error.
    pub fn no_such_database(name: impl Into<String>) -> Self {
        Self::NoSuchDatabase { name: name.into() }
    }

    /// Creates a replication unavailable error.
    pub fn replication_unavailable(message: impl Into<String>) -> Self {
        Self::ReplicationUnavailable {
            message: message.into(),
        }
    }

    /// Creates a replication failure error.
    pub fn replication_failure(message: impl Into<String>) -> Self {
        Self::ReplicationFailure {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Recreates an I/O error from a message, for reporting one failure to many waiters.
    pub fn io_failure(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io(io::Error::new(kind, message.into()))
    }

    /// Returns true if this error must abort engine startup.
    ///
    /// Corruption and storage errors during recovery leave no usable
    /// recovery point, so the engine refuses to start.
    #[must_use]
    pub fn is_fatal_to_startup(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Storage(_)
                | Self::CorruptLogEntry { .. }
                | Self::MalformedPayload { .. }
                | Self::InvalidFormat { .. }
                | Self::DatabaseLocked
        )
    }
}
