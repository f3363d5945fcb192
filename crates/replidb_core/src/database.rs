//! Database manager and database handles.
//!
//! Structural operations (create, copy, delete) log a marker entry, persist
//! the registry synchronously and hold the modification lock throughout.
//! Inserts go through the worker owning the database.

use crate::catalog::{Catalog, OpenDatabase};
use crate::checkpoint::{write_checkpoint, CheckpointFile};
use crate::engine::EngineShared;
use crate::error::{CoreError, CoreResult};
use crate::gate::ApplyGate;
use crate::insert::InsertRecordGroup;
use crate::registry::DatabaseRecord;
use crate::types::{DatabaseId, Lsn};
use crate::wal::{DatabaseMarker, DiskLogger, PayloadType};
use crate::worker::PendingResult;
use parking_lot::ReentrantMutexGuard;
use replidb_storage::{IndexImage, KeyValue, MemoryIndexStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Longest database name; snapshot-delete entries store the length in one byte.
pub const MAX_DATABASE_NAME_LEN: usize = 255;

fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.len() > MAX_DATABASE_NAME_LEN {
        return Err(CoreError::invalid_argument(format!(
            "database name must be 1..={MAX_DATABASE_NAME_LEN} bytes, got {}",
            name.len()
        )));
    }
    Ok(())
}

/// Creates, copies, deletes and looks up databases.
#[derive(Clone)]
pub struct DatabaseManager {
    shared: Arc<EngineShared>,
}

impl DatabaseManager {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Creates a database with `num_indices` indices.
    ///
    /// # Errors
    ///
    /// - `DatabaseExists` if the name is taken
    /// - `InvalidArgument` for an empty or overlong name or zero indices
    /// - `ShuttingDown` if the engine is not running
    pub fn create_database(&self, name: &str, num_indices: u32) -> CoreResult<Database> {
        validate_name(name)?;
        if num_indices == 0 {
            return Err(CoreError::invalid_argument("a database needs at least one index"));
        }

        let shared = &self.shared;
        let _lock = shared.catalog.modification_lock();
        let logger = shared.logger()?;
        let mut registry = shared.catalog.registry();
        if registry.by_name(name).is_some() {
            return Err(CoreError::DatabaseExists {
                name: name.to_string(),
            });
        }
        let id = registry.allocate_id();
        let record = DatabaseRecord::new(id, name, num_indices);
        registry.insert(record.clone())?;

        let _ticket = shared.gate.enter();
        let marker = DatabaseMarker::Created {
            id,
            num_indices,
            name: name.to_string(),
        };
        let lsn = logger.append(marker.payload_type(), marker.encode())?;

        // Checkpoint before registry: a registered database always has a mark
        write_checkpoint(
            &shared.dir,
            &CheckpointFile {
                database: id,
                mark: lsn,
                image: IndexImage::empty(num_indices as usize),
            },
        )?;
        shared.dir.save_registry(&registry)?;

        let store = Arc::new(MemoryIndexStore::new(num_indices as usize));
        shared
            .catalog
            .install(registry, Some(Arc::new(OpenDatabase::new(record, store, lsn))));

        info!(database = name, id = %id, num_indices, lsn = %lsn, "database created");
        Ok(Database::new(id, name, Arc::clone(shared)))
    }

    /// Copies `source` into a new database named `dest`.
    ///
    /// The copy reflects every entry logged before the copy marker.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if `source` does not exist and
    /// `DatabaseExists` if `dest` does.
    pub fn copy_database(&self, source: &str, dest: &str) -> CoreResult<Database> {
        validate_name(dest)?;

        let shared = &self.shared;
        let _lock = shared.catalog.modification_lock();
        let logger = shared.logger()?;
        let src = shared
            .catalog
            .by_name(source)
            .ok_or_else(|| CoreError::no_such_database(source))?;
        let mut registry = shared.catalog.registry();
        if registry.by_name(dest).is_some() {
            return Err(CoreError::DatabaseExists {
                name: dest.to_string(),
            });
        }
        let id = registry.allocate_id();
        let record = DatabaseRecord::new(id, dest, src.record().num_indices);
        registry.insert(record.clone())?;

        // Every earlier entry must be applied to the source before it is copied
        let pause = shared.gate.pause();
        let marker = DatabaseMarker::Copied {
            source: src.id(),
            dest: id,
            dest_name: dest.to_string(),
        };
        let lsn = logger.append(marker.payload_type(), marker.encode())?;
        let image = src.store().freeze();
        drop(pause);

        write_checkpoint(
            &shared.dir,
            &CheckpointFile {
                database: id,
                mark: lsn,
                image: image.clone(),
            },
        )?;
        shared.dir.save_registry(&registry)?;

        let store = Arc::new(MemoryIndexStore::from_image(image));
        shared
            .catalog
            .install(registry, Some(Arc::new(OpenDatabase::new(record, store, lsn))));

        info!(source, dest, id = %id, lsn = %lsn, "database copied");
        Ok(Database::new(id, dest, Arc::clone(shared)))
    }

    /// Deletes a database, its checkpoint and its snapshots.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if it does not exist.
    pub fn delete_database(&self, name: &str) -> CoreResult<()> {
        let _lock = self.shared.catalog.modification_lock();
        let db = self
            .shared
            .catalog
            .by_name(name)
            .ok_or_else(|| CoreError::no_such_database(name))?;
        self.delete(&db).map(|_| ())
    }

    /// Looks up a database by name.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if it does not exist.
    pub fn get_database(&self, name: &str) -> CoreResult<Database> {
        let db = self
            .shared
            .catalog
            .by_name(name)
            .ok_or_else(|| CoreError::no_such_database(name))?;
        Ok(Database::new(db.id(), db.name(), Arc::clone(&self.shared)))
    }

    /// Looks up a database by id.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if it does not exist.
    pub fn get_database_by_id(&self, id: DatabaseId) -> CoreResult<Database> {
        let db = self.shared.open_database(id)?;
        Ok(Database::new(db.id(), db.name(), Arc::clone(&self.shared)))
    }

    /// Returns every database name with its id.
    #[must_use]
    pub fn databases(&self) -> BTreeMap<String, DatabaseId> {
        self.shared
            .catalog
            .registry()
            .iter()
            .map(|record| (record.name.clone(), record.id))
            .collect()
    }

    /// Returns the id the next created database will receive.
    #[must_use]
    pub fn next_db_id(&self) -> u32 {
        self.shared.catalog.registry().next_db_id()
    }

    /// Overrides the id counter and persists it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `id` is not above every existing id.
    pub fn set_next_db_id(&self, id: u32) -> CoreResult<()> {
        let _lock = self.shared.catalog.modification_lock();
        let mut registry = self.shared.catalog.registry();
        if let Some(highest) = registry.ids().last() {
            if id <= highest.as_u32() {
                return Err(CoreError::invalid_argument(format!(
                    "next id {id} would reuse {highest}"
                )));
            }
        }
        registry.set_next_db_id(id);
        self.shared.dir.save_registry(&registry)?;
        self.shared.catalog.install(registry, None);
        Ok(())
    }

    /// Returns every database id in ascending order.
    #[must_use]
    pub fn all_database_ids(&self) -> Vec<DatabaseId> {
        self.shared.catalog.registry().ids()
    }

    /// Registers a database record directly, without a create marker.
    ///
    /// The new database starts empty. Log entries up to now are never
    /// replayed into it.
    ///
    /// # Errors
    ///
    /// - `DatabaseExists` if the id or name is taken
    /// - `InvalidArgument` for a bad name or zero indices
    pub fn put_database(&self, record: DatabaseRecord) -> CoreResult<()> {
        validate_name(&record.name)?;
        if record.num_indices == 0 {
            return Err(CoreError::invalid_argument("a database needs at least one index"));
        }

        let shared = &self.shared;
        let _lock = shared.catalog.modification_lock();
        let logger = shared.logger()?;
        let mut registry = shared.catalog.registry();
        if registry.by_id(record.id).is_some() {
            return Err(CoreError::DatabaseExists {
                name: record.name.clone(),
            });
        }
        registry.insert(record.clone())?;

        let mark = {
            let _pause = shared.gate.pause();
            logger.last_assigned_lsn()
        };
        write_checkpoint(
            &shared.dir,
            &CheckpointFile {
                database: record.id,
                mark,
                image: IndexImage::empty(record.num_indices as usize),
            },
        )?;
        shared.dir.save_registry(&registry)?;

        let store = Arc::new(MemoryIndexStore::new(record.num_indices as usize));
        info!(database = %record.name, id = %record.id, mark = %mark, "database record installed");
        shared
            .catalog
            .install(registry, Some(Arc::new(OpenDatabase::new(record, store, mark))));
        Ok(())
    }

    /// Deletes a database by id. Returns `None` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete marker or registry cannot be written.
    pub fn remove_database_by_id(&self, id: DatabaseId) -> CoreResult<Option<DatabaseRecord>> {
        let _lock = self.shared.catalog.modification_lock();
        match self.shared.catalog.get(id) {
            Some(db) => self.delete(&db).map(Some),
            None => Ok(None),
        }
    }

    /// The single lock guarding database metadata.
    ///
    /// Code that changes database metadata outside this manager must hold
    /// it. The lock is reentrant.
    pub fn modification_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.shared.catalog.modification_lock()
    }

    /// Logs the delete marker and removes the database. Caller holds the lock.
    fn delete(&self, db: &OpenDatabase) -> CoreResult<DatabaseRecord> {
        let shared = &self.shared;
        let logger = shared.logger()?;
        let mut registry = shared.catalog.registry();
        let record = registry
            .remove(db.id())
            .ok_or_else(|| CoreError::no_such_database(db.name()))?;

        let lsn = {
            let _ticket = shared.gate.enter();
            let marker = DatabaseMarker::Deleted {
                id: record.id,
                name: record.name.clone(),
            };
            let lsn = logger.append(marker.payload_type(), marker.encode())?;
            shared.dir.save_registry(&registry)?;
            shared.catalog.remove(registry, record.id);
            lsn
        };
        shared.dir.remove_database_files(record.id)?;
        shared.snapshots.forget_database(record.id);

        info!(database = %record.name, id = %record.id, lsn = %lsn, "database deleted");
        Ok(record)
    }
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager").finish_non_exhaustive()
    }
}

/// Logs a group, then applies it. Runs on the worker owning the database,
/// or on the caller's thread when there are no workers.
fn apply_insert(
    catalog: &Catalog,
    gate: &ApplyGate,
    logger: &DiskLogger,
    group: &InsertRecordGroup,
) -> CoreResult<Lsn> {
    let _ticket = gate.enter();
    let db = catalog
        .get(group.database_id())
        .ok_or_else(|| CoreError::no_such_database(format!("#{}", group.database_id().as_u32())))?;
    db.check_group(group)?;
    let _order = db.sequence();
    let lsn = logger.append(PayloadType::Insert, group.encode())?;
    if !db.apply(lsn, group)? {
        return Err(CoreError::invalid_format(format!(
            "{lsn} is not newer than the applied lsn {} of {}",
            db.applied(),
            db.name()
        )));
    }
    Ok(lsn)
}

/// Handle to one database.
///
/// The handle stores the id only; every call looks the database up again,
/// so a handle to a deleted database fails with `NoSuchDatabase`.
#[derive(Clone)]
pub struct Database {
    id: DatabaseId,
    name: String,
    shared: Arc<EngineShared>,
}

impl Database {
    pub(crate) fn new(id: DatabaseId, name: &str, shared: Arc<EngineShared>) -> Self {
        Self {
            id,
            name: name.to_string(),
            shared,
        }
    }

    /// Database id.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> CoreResult<Arc<OpenDatabase>> {
        self.shared
            .catalog
            .get(self.id)
            .ok_or_else(|| CoreError::no_such_database(&self.name))
    }

    /// Number of indices.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if the database was deleted.
    pub fn num_indices(&self) -> CoreResult<usize> {
        Ok(self.open()?.num_indices())
    }

    /// LSN of the last entry applied to this database.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if the database was deleted.
    pub fn lsn(&self) -> CoreResult<Lsn> {
        Ok(self.open()?.applied())
    }

    /// Starts an empty insert group for this database.
    #[must_use]
    pub fn create_insert_group(&self) -> InsertRecordGroup {
        InsertRecordGroup::new(self.id)
    }

    /// Logs and applies a group, returning its LSN.
    ///
    /// # Errors
    ///
    /// - `NoSuchIndex` if the group touches a missing index; nothing is logged
    /// - `NoSuchDatabase` if the database was deleted
    /// - `ShuttingDown` if the engine is not running
    pub fn insert(&self, group: InsertRecordGroup) -> CoreResult<Lsn> {
        self.insert_async(group)?.wait()
    }

    /// Submits a group and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the group targets another database and
    /// `ShuttingDown` if the engine is not running.
    pub fn insert_async(&self, group: InsertRecordGroup) -> CoreResult<PendingResult<Lsn>> {
        if group.database_id() != self.id {
            return Err(CoreError::invalid_argument(format!(
                "group for {} submitted to {}",
                group.database_id(),
                self.id
            )));
        }
        let logger = self.shared.logger()?;
        let catalog = Arc::clone(&self.shared.catalog);
        let gate = Arc::clone(&self.shared.gate);
        self.shared.submit(self.id, move || {
            apply_insert(&catalog, &gate, &logger, &group)
        })
    }

    /// Looks up a key.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchIndex` or `NoSuchDatabase`.
    pub fn lookup(&self, index: usize, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let db = self.open()?;
        db.check_index(index)?;
        Ok(db.store().get(index, key)?)
    }

    /// Returns every entry whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchIndex` or `NoSuchDatabase`.
    pub fn prefix_lookup(&self, index: usize, prefix: &[u8]) -> CoreResult<Vec<KeyValue>> {
        let db = self.open()?;
        db.check_index(index)?;
        Ok(db.store().prefix_scan(index, prefix)?)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
