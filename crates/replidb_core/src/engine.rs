//! Engine lifecycle: open, recover, run, stop, restart and shut down.

use crate::catalog::{Catalog, OpenDatabase};
use crate::checkpoint::{CheckpointContext, CheckpointReport, Checkpointer};
use crate::config::Config;
use crate::database::DatabaseManager;
use crate::dir::EngineDir;
use crate::error::{CoreError, CoreResult};
use crate::gate::ApplyGate;
use crate::insert::InsertRecordGroup;
use crate::recovery::{following, recovery_start, LogReplayer, ReplaySink};
use crate::snapshot::{SnapshotManager, SnapshotStore};
use crate::types::{DatabaseId, Lsn};
use crate::wal::{DiskLogger, SnapshotCreated, SnapshotDeleted};
use crate::worker::{PendingResult, WorkerPool};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Background components that exist only while the engine runs.
struct Runtime {
    logger: Arc<DiskLogger>,
    workers: WorkerPool,
    checkpointer: Checkpointer,
}

/// State shared by the engine and every handle it gives out.
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    pub(crate) dir: Arc<EngineDir>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) gate: Arc<ApplyGate>,
    pub(crate) snapshots: SnapshotStore,
    runtime: RwLock<Option<Runtime>>,
    lifecycle: Mutex<()>,
    accepting: AtomicBool,
    closed: AtomicBool,
}

impl EngineShared {
    /// The running logger.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` unless the engine accepts operations.
    pub(crate) fn logger(&self) -> CoreResult<Arc<DiskLogger>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        self.runtime
            .read()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.logger))
            .ok_or(CoreError::ShuttingDown)
    }

    /// Hands a job to the worker that owns `database`.
    pub(crate) fn submit<T, F>(&self, database: DatabaseId, job: F) -> CoreResult<PendingResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> CoreResult<T> + Send + 'static,
    {
        let runtime = self.runtime.read();
        let runtime = runtime.as_ref().ok_or(CoreError::ShuttingDown)?;
        runtime.workers.submit(database, job)
    }

    pub(crate) fn open_database(&self, id: DatabaseId) -> CoreResult<Arc<OpenDatabase>> {
        self.catalog
            .get(id)
            .ok_or_else(|| CoreError::no_such_database(format!("#{}", id.as_u32())))
    }

    /// Loads on-disk state, replays the log and starts the runtime.
    ///
    /// Recovery runs on a staging catalog that replaces the live one only
    /// once replay succeeded. On failure no database stays open.
    ///
    /// Returns the LSN of the last entry reflected in every database.
    fn start(&self) -> CoreResult<Lsn> {
        self.snapshots.clear();
        let staging = Catalog::new();
        let recovered = staging
            .load(&self.dir)
            .and_then(|()| self.recover(&staging));
        let next = match recovered {
            Ok(next) => next,
            Err(e) => {
                self.catalog.clear();
                return Err(e);
            }
        };
        self.catalog.adopt(staging);

        let logger = Arc::new(DiskLogger::start(&self.config, next)?);
        let workers = WorkerPool::start(self.config.num_threads, self.config.max_queue_length)?;
        let context = Arc::new(CheckpointContext::new(
            Arc::clone(&self.dir),
            Arc::clone(&self.catalog),
            Arc::clone(&self.gate),
            Arc::clone(&logger),
        ));
        let checkpointer = Checkpointer::start(
            context,
            self.config.checkpoint_interval,
            self.config.max_log_file_size,
        )?;

        *self.runtime.write() = Some(Runtime {
            logger,
            workers,
            checkpointer,
        });
        self.accepting.store(true, Ordering::Release);
        info!(
            next = %next,
            databases = self.catalog.open_databases().len(),
            workers = self.config.num_threads,
            "engine started"
        );
        Ok(next.prev())
    }

    fn recover(&self, catalog: &Catalog) -> CoreResult<Lsn> {
        let start = recovery_start(&catalog.applied_lsns())?;
        let mut sink = EngineReplay {
            shared: self,
            catalog,
        };
        let outcome = LogReplayer::new(&self.config.log_dir).replay(start, &mut sink)?;

        // Never resume below what a checkpoint already reflects
        let mut next = outcome.next_lsn;
        if let Some(highest) = catalog.applied_lsns().into_iter().max() {
            let after = following(highest)?;
            if after > next {
                warn!(highest = %highest, next = %next, "checkpoint ahead of log");
                next = after;
            }
        }

        let last = next.prev();
        for db in catalog.open_databases() {
            db.set_applied(last);
        }
        Ok(next)
    }

    /// Stops the runtime in order: stop accepting, drain workers, drain the
    /// logger, stop the checkpoint coordinator. Every step runs; the first
    /// error is returned.
    fn stop_runtime(&self) -> CoreResult<()> {
        self.accepting.store(false, Ordering::Release);
        let Some(mut runtime) = self.runtime.write().take() else {
            return Ok(());
        };

        let mut first_error = None;
        runtime.workers.shutdown();
        debug!("workers drained");

        runtime.logger.shutdown();
        if let Err(e) = runtime.logger.wait_for_shutdown() {
            warn!(error = %e, "logger shutdown failed");
            first_error.get_or_insert(e);
        }

        if let Err(e) = runtime.checkpointer.stop() {
            warn!(error = %e, "checkpoint coordinator shutdown failed");
            first_error.get_or_insert(e);
        }

        info!("engine stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Applies replayed entries to the open databases.
struct EngineReplay<'a> {
    shared: &'a EngineShared,
    catalog: &'a Catalog,
}

impl ReplaySink for EngineReplay<'_> {
    fn insert(&mut self, lsn: Lsn, group: InsertRecordGroup) -> CoreResult<()> {
        let Some(db) = self.catalog.get(group.database_id()) else {
            debug!(lsn = %lsn, database = %group.database_id(), "skipping insert for unknown database");
            return Ok(());
        };
        db.check_group(&group)?;
        db.apply(lsn, &group)?;
        Ok(())
    }

    fn snapshot_create(&mut self, lsn: Lsn, created: SnapshotCreated) -> CoreResult<()> {
        let shared = self.shared;
        let Some(db) = self.catalog.get(created.database) else {
            return Ok(());
        };
        if lsn <= db.applied() {
            return Ok(());
        }
        if shared.snapshots.exists(&shared.dir, db.id(), &created.config.name) {
            debug!(snapshot = %created.config.name, "snapshot already on disk");
        } else {
            shared
                .snapshots
                .write(&shared.dir, db.id(), lsn, created.config, db.store())?;
        }
        db.advance_applied(lsn);
        Ok(())
    }

    fn snapshot_delete(&mut self, lsn: Lsn, deleted: SnapshotDeleted) -> CoreResult<()> {
        let shared = self.shared;
        let Some(db) = self.catalog.by_name(&deleted.database_name) else {
            return Ok(());
        };
        if lsn <= db.applied() {
            return Ok(());
        }
        shared
            .snapshots
            .remove(&shared.dir, db.id(), &deleted.snapshot_name)?;
        db.advance_applied(lsn);
        Ok(())
    }
}

/// An open replidb engine.
///
/// ```rust,no_run
/// use replidb_core::{Config, Engine};
///
/// let engine = Engine::open(Config::new("/tmp/replidb")).unwrap();
/// let users = engine.database_manager().create_database("users", 1).unwrap();
///
/// let mut group = users.create_insert_group();
/// group.add_insert(0, b"ada".to_vec(), b"lovelace".to_vec());
/// users.insert(group).unwrap();
///
/// engine.shutdown().unwrap();
/// ```
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Opens the engine: locks the base directory, loads the registry and
    /// checkpoints, replays the log and starts the logger, workers and
    /// checkpoint coordinator.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another process holds the directory
    /// - `CorruptLogEntry` or `MalformedPayload` if the log cannot be replayed
    /// - `InvalidFormat` for an unreadable registry or checkpoint
    /// - `Io` on file system failures
    pub fn open(config: Config) -> CoreResult<Self> {
        let dir = Arc::new(EngineDir::open(&config)?);
        let shared = Arc::new(EngineShared {
            config,
            dir,
            catalog: Arc::new(Catalog::new()),
            gate: Arc::new(ApplyGate::new()),
            snapshots: SnapshotStore::new(),
            runtime: RwLock::new(None),
            lifecycle: Mutex::new(()),
            accepting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        {
            let _lifecycle = shared.lifecycle.lock();
            shared.start()?;
        }
        Ok(Self { shared })
    }

    /// Returns the configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns the database manager.
    #[must_use]
    pub fn database_manager(&self) -> DatabaseManager {
        DatabaseManager::new(Arc::clone(&self.shared))
    }

    /// Returns the snapshot manager.
    #[must_use]
    pub fn snapshot_manager(&self) -> SnapshotManager {
        SnapshotManager::new(Arc::clone(&self.shared))
    }

    /// Returns true while the engine accepts operations.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// LSN the next logged entry will receive.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine is not running.
    pub fn next_lsn(&self) -> CoreResult<Lsn> {
        Ok(self.shared.logger()?.next_lsn())
    }

    /// LSN of the last entry handed to the file system.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine is not running.
    pub fn last_written_lsn(&self) -> CoreResult<Lsn> {
        Ok(self.shared.logger()?.last_written_lsn())
    }

    /// Starts a new view; the next entry is logged as `(view, 1)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `view` is greater than the current view.
    pub fn new_view(&self, view: u32) -> CoreResult<Lsn> {
        self.shared.logger()?.new_view(view)
    }

    /// Forces a checkpoint.
    ///
    /// Returns `None` if a checkpoint was already running; the two are
    /// coalesced.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine is not running, or the first
    /// error writing checkpoint files or deleting segments.
    pub fn checkpoint(&self) -> CoreResult<Option<CheckpointReport>> {
        let context = self
            .shared
            .runtime
            .read()
            .as_ref()
            .map(|runtime| runtime.checkpointer.context())
            .ok_or(CoreError::ShuttingDown)?;
        context.run()
    }

    /// Stops all background components but keeps the directory lock and
    /// the loaded databases.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while stopping.
    pub fn stop(&self) -> CoreResult<()> {
        let _lifecycle = self.shared.lifecycle.lock();
        self.shared.stop_runtime()
    }

    /// Reloads on-disk state, replays the log and starts again.
    ///
    /// Returns the LSN of the last entry every database reflects.
    ///
    /// # Errors
    ///
    /// - `NotStopped` if the engine is running
    /// - `ShuttingDown` after [`Engine::shutdown`]
    /// - any recovery error
    pub fn restart(&self) -> CoreResult<Lsn> {
        let _lifecycle = self.shared.lifecycle.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        if self.shared.runtime.read().is_some() {
            return Err(CoreError::NotStopped);
        }
        self.shared.start()
    }

    /// Shuts the engine down and releases the stores.
    ///
    /// The directory lock is released once the engine and every handle are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while stopping.
    pub fn shutdown(&self) -> CoreResult<()> {
        let _lifecycle = self.shared.lifecycle.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shared.stop_runtime();
        self.shared.catalog.clear();
        self.shared.snapshots.clear();
        info!(dir = %self.shared.dir.base().display(), "engine shut down");
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.shared.config.base_dir)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
