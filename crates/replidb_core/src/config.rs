//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the log directory inside the base directory.
const DEFAULT_LOG_DIR: &str = "log";

/// When an append is considered durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync before `append` returns.
    Sync,
    /// Return after buffering; the writer fsyncs every `async_flush_interval`.
    Async,
    /// Batch appends for up to the given window and fsync once per window.
    PseudoSync(Duration),
}

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the registry, checkpoints and snapshots.
    pub base_dir: PathBuf,

    /// Directory holding the log segments.
    pub log_dir: PathBuf,

    /// Durability mode of the write-ahead logger.
    pub sync_mode: SyncMode,

    /// Flush period used by [`SyncMode::Async`].
    pub async_flush_interval: Duration,

    /// Maximum number of queued operations per worker (and per logger slot).
    pub max_queue_length: usize,

    /// Number of worker threads (0 = apply on the calling thread).
    pub num_threads: usize,

    /// How often to checkpoint (zero disables the timer).
    pub checkpoint_interval: Duration,

    /// Maximum size of a log segment; also the log volume that forces a checkpoint.
    pub max_log_file_size: u64,
}

impl Config {
    /// Creates a configuration rooted at `base_dir` with default values.
    ///
    /// The log directory defaults to `<base_dir>/log`.
    #[must_use]
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            log_dir: base_dir.join(DEFAULT_LOG_DIR),
            base_dir,
            sync_mode: SyncMode::Sync,
            async_flush_interval: Duration::from_millis(100),
            max_queue_length: 1_000,
            num_threads: 1,
            checkpoint_interval: Duration::ZERO, // disabled
            max_log_file_size: 16 * 1024 * 1024, // 16 MB
        }
    }

    /// Sets the log directory.
    #[must_use]
    pub fn log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub const fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets the flush period for [`SyncMode::Async`].
    #[must_use]
    pub const fn async_flush_interval(mut self, interval: Duration) -> Self {
        self.async_flush_interval = interval;
        self
    }

    /// Sets the maximum queue length.
    #[must_use]
    pub const fn max_queue_length(mut self, len: usize) -> Self {
        self.max_queue_length = len;
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub const fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the maximum log file size.
    #[must_use]
    pub const fn max_log_file_size(mut self, size: u64) -> Self {
        self.max_log_file_size = size;
        self
    }

    /// Capacity of the logger's request queue.
    pub(crate) fn logger_queue_capacity(&self) -> usize {
        self.max_queue_length.max(1) * self.num_threads.max(1)
    }
}
