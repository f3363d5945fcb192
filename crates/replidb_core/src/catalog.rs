//! In-memory catalog of open databases.
//!
//! The catalog pairs the persisted [`DatabaseRegistry`] with one open store
//! per database. Structural changes (create, copy, delete, administrative
//! edits) and checkpoints serialize on the catalog's modification lock.

use crate::checkpoint::read_checkpoint;
use crate::dir::EngineDir;
use crate::error::{CoreError, CoreResult};
use crate::insert::InsertRecordGroup;
use crate::registry::{DatabaseRecord, DatabaseRegistry};
use crate::types::{DatabaseId, Lsn};
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard, RwLock};
use replidb_storage::{IndexStore, MemoryIndexStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A database with its store and the LSN of the last entry applied to it.
pub(crate) struct OpenDatabase {
    record: DatabaseRecord,
    store: Arc<dyn IndexStore>,
    applied: Mutex<Lsn>,
    /// Held from LSN assignment through apply for live mutations.
    sequencer: Mutex<()>,
}

impl OpenDatabase {
    pub(crate) fn new(record: DatabaseRecord, store: Arc<dyn IndexStore>, applied: Lsn) -> Self {
        Self {
            record,
            store,
            applied: Mutex::new(applied),
            sequencer: Mutex::new(()),
        }
    }

    /// Serializes live mutations of this database so they apply in LSN
    /// order even when callers run them on their own threads.
    pub(crate) fn sequence(&self) -> MutexGuard<'_, ()> {
        self.sequencer.lock()
    }

    pub(crate) fn id(&self) -> DatabaseId {
        self.record.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.record.name
    }

    pub(crate) fn num_indices(&self) -> usize {
        self.record.num_indices as usize
    }

    pub(crate) fn record(&self) -> &DatabaseRecord {
        &self.record
    }

    pub(crate) fn store(&self) -> &dyn IndexStore {
        self.store.as_ref()
    }

    pub(crate) fn applied(&self) -> Lsn {
        *self.applied.lock()
    }

    pub(crate) fn set_applied(&self, lsn: Lsn) {
        *self.applied.lock() = lsn;
    }

    /// Raises the applied LSN to `lsn` if it is behind.
    pub(crate) fn advance_applied(&self, lsn: Lsn) {
        let mut applied = self.applied.lock();
        if lsn > *applied {
            *applied = lsn;
        }
    }

    pub(crate) fn check_index(&self, index: usize) -> CoreResult<()> {
        if index < self.num_indices() {
            Ok(())
        } else {
            Err(CoreError::NoSuchIndex {
                database: self.record.name.clone(),
                index,
                count: self.num_indices(),
            })
        }
    }

    /// Rejects groups touching an index outside `0..num_indices`.
    pub(crate) fn check_group(&self, group: &InsertRecordGroup) -> CoreResult<()> {
        match group.max_index() {
            Some(index) => self.check_index(index as usize),
            None => Ok(()),
        }
    }

    /// Applies a record group logged at `lsn`.
    ///
    /// Returns `false` without touching the store if `lsn` is not newer than
    /// the applied LSN.
    pub(crate) fn apply(&self, lsn: Lsn, group: &InsertRecordGroup) -> CoreResult<bool> {
        let mut applied = self.applied.lock();
        if lsn <= *applied {
            return Ok(false);
        }
        for record in group.records() {
            let index = record.index as usize;
            match &record.value {
                Some(value) => self.store.put(index, &record.key, value)?,
                None => self.store.remove(index, &record.key)?,
            }
        }
        *applied = lsn;
        Ok(true)
    }
}

impl std::fmt::Debug for OpenDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDatabase")
            .field("record", &self.record)
            .field("applied", &self.applied())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    registry: DatabaseRegistry,
    open: BTreeMap<DatabaseId, Arc<OpenDatabase>>,
}

/// Registry plus open stores, guarded by the modification lock.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    lock: ReentrantMutex<()>,
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replaces the catalog with the registry and checkpoints on disk.
    ///
    /// A database without a checkpoint starts empty at [`Lsn::ZERO`].
    pub(crate) fn load(&self, dir: &EngineDir) -> CoreResult<()> {
        let _lock = self.modification_lock();
        let registry = dir.load_registry()?.unwrap_or_default();

        let mut open = BTreeMap::new();
        for record in registry.iter() {
            let (store, applied) = match read_checkpoint(dir, record.id)? {
                Some(checkpoint) => {
                    if checkpoint.image.num_indices() != record.num_indices as usize {
                        return Err(CoreError::invalid_format(format!(
                            "checkpoint of {} has {} indices, registry says {}",
                            record.name,
                            checkpoint.image.num_indices(),
                            record.num_indices
                        )));
                    }
                    (MemoryIndexStore::from_image(checkpoint.image), checkpoint.mark)
                }
                None => (MemoryIndexStore::new(record.num_indices as usize), Lsn::ZERO),
            };
            debug!(database = %record.name, id = %record.id, mark = %applied, "database loaded");
            open.insert(
                record.id,
                Arc::new(OpenDatabase::new(record.clone(), Arc::new(store), applied)),
            );
        }

        *self.state.write() = CatalogState { registry, open };
        Ok(())
    }

    /// The single lock guarding database metadata.
    pub(crate) fn modification_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn get(&self, id: DatabaseId) -> Option<Arc<OpenDatabase>> {
        self.state.read().open.get(&id).cloned()
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<OpenDatabase>> {
        let state = self.state.read();
        let id = state.registry.by_name(name)?.id;
        state.open.get(&id).cloned()
    }

    /// Returns a copy of the registry.
    pub(crate) fn registry(&self) -> DatabaseRegistry {
        self.state.read().registry.clone()
    }

    pub(crate) fn open_databases(&self) -> Vec<Arc<OpenDatabase>> {
        self.state.read().open.values().cloned().collect()
    }

    /// Checkpoint marks (applied LSNs) of every open database.
    pub(crate) fn applied_lsns(&self) -> Vec<Lsn> {
        self.state
            .read()
            .open
            .values()
            .map(|db| db.applied())
            .collect()
    }

    /// Installs a new registry, optionally opening a database with it.
    pub(crate) fn install(&self, registry: DatabaseRegistry, database: Option<Arc<OpenDatabase>>) {
        let mut state = self.state.write();
        state.registry = registry;
        if let Some(database) = database {
            state.open.insert(database.id(), database);
        }
    }

    /// Installs a new registry and closes a database.
    pub(crate) fn remove(&self, registry: DatabaseRegistry, id: DatabaseId) -> Option<Arc<OpenDatabase>> {
        let mut state = self.state.write();
        state.registry = registry;
        state.open.remove(&id)
    }

    /// Takes over the registry and databases of `other`.
    pub(crate) fn adopt(&self, other: Catalog) {
        let _lock = self.modification_lock();
        *self.state.write() = other.state.into_inner();
    }

    /// Closes every database.
    pub(crate) fn clear(&self) {
        *self.state.write() = CatalogState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{write_checkpoint, CheckpointFile};
    use crate::config::Config;
    use replidb_storage::IndexImage;
    use tempfile::tempdir;

    fn open_db(applied: Lsn) -> OpenDatabase {
        OpenDatabase::new(
            DatabaseRecord::new(DatabaseId::new(1), "users", 2),
            Arc::new(MemoryIndexStore::new(2)),
            applied,
        )
    }

    #[test]
    fn apply_is_idempotent_per_lsn() {
        let db = open_db(Lsn::new(1, 3));
        let mut group = InsertRecordGroup::new(db.id());
        group.add_insert(0, b"k".to_vec(), b"v".to_vec());

        assert!(!db.apply(Lsn::new(1, 3), &group).unwrap());
        assert!(db.store().get(0, b"k").unwrap().is_none());

        assert!(db.apply(Lsn::new(1, 4), &group).unwrap());
        assert!(!db.apply(Lsn::new(1, 4), &group).unwrap());
        assert_eq!(db.applied(), Lsn::new(1, 4));
        assert_eq!(db.store().get(0, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn group_index_is_checked() {
        let db = open_db(Lsn::ZERO);
        let mut group = InsertRecordGroup::new(db.id());
        group.add_delete(2, b"k".to_vec());
        assert!(matches!(
            db.check_group(&group),
            Err(CoreError::NoSuchIndex { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn load_uses_checkpoints() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();

        let mut registry = DatabaseRegistry::new();
        let a = registry.allocate_id();
        registry.insert(DatabaseRecord::new(a, "a", 1)).unwrap();
        let b = registry.allocate_id();
        registry.insert(DatabaseRecord::new(b, "b", 2)).unwrap();
        engine_dir.save_registry(&registry).unwrap();

        let mut image = IndexImage::empty(1).into_indices();
        image[0].insert(b"x".to_vec(), b"1".to_vec());
        write_checkpoint(
            &engine_dir,
            &CheckpointFile {
                database: a,
                mark: Lsn::new(1, 10),
                image: IndexImage::from_indices(image),
            },
        )
        .unwrap();

        let catalog = Catalog::new();
        catalog.load(&engine_dir).unwrap();

        let loaded_a = catalog.by_name("a").unwrap();
        assert_eq!(loaded_a.applied(), Lsn::new(1, 10));
        assert_eq!(loaded_a.store().get(0, b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(catalog.get(b).unwrap().applied(), Lsn::ZERO);

        let mut marks = catalog.applied_lsns();
        marks.sort();
        assert_eq!(marks, vec![Lsn::ZERO, Lsn::new(1, 10)]);
    }

    #[test]
    fn load_rejects_shape_mismatch() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let mut registry = DatabaseRegistry::new();
        let id = registry.allocate_id();
        registry.insert(DatabaseRecord::new(id, "a", 3)).unwrap();
        engine_dir.save_registry(&registry).unwrap();
        write_checkpoint(
            &engine_dir,
            &CheckpointFile {
                database: id,
                mark: Lsn::FIRST,
                image: IndexImage::empty(1),
            },
        )
        .unwrap();

        assert!(matches!(
            Catalog::new().load(&engine_dir),
            Err(CoreError::InvalidFormat { .. })
        ));
    }
}
