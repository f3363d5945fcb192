//! Persistent snapshots: frozen, named copies of selected indices.
//!
//! Creating a snapshot logs a `SnapshotCreate` entry and then writes
//! `snapshots/<db>/<name>.snap`. Replay recreates snapshots whose files are
//! missing and removes those deleted after the checkpoint, without logging
//! again.
//!
//! ## File Format
//!
//! ```text
//! | magic "RSNP" (4) | version (2) | db_id (4) | view (4) | seq (8) |
//! | config | image_len (8) | index image | crc32 (4) |
//! ```

use crate::dir::{write_atomic, EngineDir};
use crate::engine::EngineShared;
use crate::error::{CoreError, CoreResult};
use crate::types::{DatabaseId, Lsn};
use crate::wal::{put_name_u16, PayloadReader, PayloadType, SnapshotCreated, SnapshotDeleted};
use parking_lot::Mutex;
use replidb_storage::{IndexImage, IndexStore, KeyValue};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info};

/// Magic bytes of a snapshot file.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RSNP";

/// Current snapshot file version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Describes a snapshot: its name and the indices it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Snapshot name, unique per database.
    pub name: String,
    /// Indices to capture.
    pub indices: Vec<usize>,
}

impl SnapshotConfig {
    /// Creates a snapshot descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, indices: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            indices,
        }
    }

    /// Appends `name_len:u16 | name | count:u32 | index:u32...`.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        put_name_u16(buf, &self.name)?;
        buf.extend_from_slice(&(self.indices.len() as u32).to_le_bytes());
        for &index in &self.indices {
            let index = u32::try_from(index)
                .map_err(|_| CoreError::invalid_argument(format!("index {index} out of range")))?;
            buf.extend_from_slice(&index.to_le_bytes());
        }
        Ok(())
    }

    pub(crate) fn decode_from(reader: &mut PayloadReader<'_>) -> CoreResult<Self> {
        let name_len = reader.u16()? as usize;
        let name = reader.string(name_len)?;
        let count = reader.u32()? as usize;
        let mut indices = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            indices.push(reader.u32()? as usize);
        }
        Ok(Self { name, indices })
    }

    fn validate(&self, num_indices: usize, database: &str) -> CoreResult<()> {
        let name = &self.name;
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.chars().any(char::is_control)
        {
            return Err(CoreError::invalid_argument(format!(
                "invalid snapshot name: {name:?}"
            )));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= num_indices) {
            return Err(CoreError::NoSuchIndex {
                database: database.to_string(),
                index: bad,
                count: num_indices,
            });
        }
        Ok(())
    }
}

/// A loaded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSnapshot {
    database: DatabaseId,
    lsn: Lsn,
    config: SnapshotConfig,
    image: IndexImage,
}

impl PersistentSnapshot {
    /// Database the snapshot was taken from.
    #[must_use]
    pub fn database(&self) -> DatabaseId {
        self.database
    }

    /// LSN of the `SnapshotCreate` entry; the snapshot reflects every entry before it.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// The descriptor the snapshot was created with.
    #[must_use]
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Looks up a key in a captured index.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchIndex` if the index was not captured.
    pub fn get(&self, index: usize, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.captured(index)?.get(key).cloned())
    }

    /// Returns entries of a captured index whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchIndex` if the index was not captured.
    pub fn prefix_scan(&self, index: usize, prefix: &[u8]) -> CoreResult<Vec<KeyValue>> {
        Ok(self
            .captured(index)?
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn captured(&self, index: usize) -> CoreResult<&BTreeMap<Vec<u8>, Vec<u8>>> {
        let missing = || CoreError::NoSuchIndex {
            database: format!("{}/{}", self.database, self.config.name),
            index,
            count: self.image.num_indices(),
        };
        if !self.config.indices.contains(&index) {
            return Err(missing());
        }
        self.image.index(index).ok_or_else(missing)
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.database.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.lsn.view_id().to_le_bytes());
        buf.extend_from_slice(&self.lsn.sequence_no().to_le_bytes());
        self.config.encode_into(&mut buf)?;
        let image = self.image.encode()?;
        buf.extend_from_slice(&(image.len() as u64).to_le_bytes());
        buf.extend_from_slice(&image);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < SNAPSHOT_MAGIC.len() + 4 || data[0..4] != SNAPSHOT_MAGIC {
            return Err(CoreError::invalid_format("invalid snapshot magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
            return Err(CoreError::invalid_format("snapshot checksum mismatch"));
        }

        let parse = || -> CoreResult<Self> {
            let mut reader = PayloadReader::new(&body[4..]);
            let version = reader.u16()?;
            if version > SNAPSHOT_VERSION {
                return Err(CoreError::invalid_format(format!(
                    "unsupported snapshot version: {version}"
                )));
            }
            let database = DatabaseId::new(reader.u32()?);
            let lsn = reader.lsn()?;
            let config = SnapshotConfig::decode_from(&mut reader)?;
            let image_len = reader.u64()? as usize;
            let image = IndexImage::decode(reader.bytes(image_len)?)?;
            reader.finish("snapshot")?;
            Ok(Self {
                database,
                lsn,
                config,
                image,
            })
        };
        parse().map_err(|e| match e {
            CoreError::MalformedPayload { message } => CoreError::invalid_format(message),
            other => other,
        })
    }
}

/// Snapshot files plus a cache of the ones already loaded.
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    cache: Mutex<HashMap<(DatabaseId, String), Arc<PersistentSnapshot>>>,
}

impl SnapshotStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Freezes the selected indices of `store` and writes the snapshot file.
    pub(crate) fn write(
        &self,
        dir: &EngineDir,
        database: DatabaseId,
        lsn: Lsn,
        config: SnapshotConfig,
        store: &dyn IndexStore,
    ) -> CoreResult<Arc<PersistentSnapshot>> {
        let image = store.freeze().retain_indices(&config.indices);
        let snapshot = PersistentSnapshot {
            database,
            lsn,
            config,
            image,
        };
        fs::create_dir_all(dir.snapshot_dir(database))?;
        write_atomic(
            &dir.snapshot_path(database, &snapshot.config.name),
            &snapshot.encode()?,
        )?;

        let snapshot = Arc::new(snapshot);
        self.cache.lock().insert(
            (database, snapshot.config.name.clone()),
            Arc::clone(&snapshot),
        );
        Ok(snapshot)
    }

    /// Returns a snapshot, reading its file on first use.
    pub(crate) fn load(
        &self,
        dir: &EngineDir,
        database: DatabaseId,
        database_name: &str,
        name: &str,
    ) -> CoreResult<Arc<PersistentSnapshot>> {
        let key = (database, name.to_string());
        if let Some(snapshot) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(snapshot));
        }

        let data = match fs::read(dir.snapshot_path(database, name)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CoreError::NoSuchSnapshot {
                    database: database_name.to_string(),
                    snapshot: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = Arc::new(PersistentSnapshot::decode(&data)?);
        debug!(database = %database, snapshot = name, "snapshot loaded");
        self.cache.lock().insert(key, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Returns true if the snapshot file exists.
    pub(crate) fn exists(&self, dir: &EngineDir, database: DatabaseId, name: &str) -> bool {
        dir.snapshot_path(database, name).exists()
    }

    /// Removes a snapshot file. Returns false if it did not exist.
    pub(crate) fn remove(&self, dir: &EngineDir, database: DatabaseId, name: &str) -> CoreResult<bool> {
        self.cache.lock().remove(&(database, name.to_string()));
        match fs::remove_file(dir.snapshot_path(database, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops every cached snapshot of a database.
    pub(crate) fn forget_database(&self, database: DatabaseId) {
        self.cache.lock().retain(|(db, _), _| *db != database);
    }

    pub(crate) fn clear(&self) {
        self.cache.lock().clear();
    }
}

/// Creates, deletes and reads persistent snapshots.
#[derive(Clone)]
pub struct SnapshotManager {
    shared: Arc<EngineShared>,
}

impl SnapshotManager {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Logs a `SnapshotCreate` entry and writes the snapshot.
    ///
    /// The snapshot reflects every entry logged before the returned LSN and
    /// nothing after it.
    ///
    /// # Errors
    ///
    /// - `NoSuchDatabase` if the database does not exist
    /// - `NoSuchIndex` if a listed index is out of range
    /// - `SnapshotExists` if the name is taken
    /// - `InvalidArgument` for an unusable snapshot name
    pub fn create_persistent_snapshot(
        &self,
        database: &str,
        config: SnapshotConfig,
    ) -> CoreResult<Lsn> {
        let shared = &self.shared;
        let _lock = shared.catalog.modification_lock();
        let logger = shared.logger()?;
        let db = shared
            .catalog
            .by_name(database)
            .ok_or_else(|| CoreError::no_such_database(database))?;
        config.validate(db.num_indices(), database)?;
        if shared.snapshots.exists(&shared.dir, db.id(), &config.name) {
            return Err(CoreError::SnapshotExists {
                database: database.to_string(),
                snapshot: config.name,
            });
        }

        // Everything logged before the snapshot entry must be applied first
        let _pause = shared.gate.pause();
        let payload = SnapshotCreated {
            database: db.id(),
            config: config.clone(),
        }
        .encode()?;
        let lsn = logger.append(PayloadType::SnapshotCreate, payload)?;
        shared
            .snapshots
            .write(&shared.dir, db.id(), lsn, config.clone(), db.store())?;
        db.advance_applied(lsn);

        info!(database, snapshot = %config.name, lsn = %lsn, "snapshot created");
        Ok(lsn)
    }

    /// Logs a `SnapshotDelete` entry and removes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` or `NoSuchSnapshot` if either is missing.
    pub fn delete_persistent_snapshot(&self, database: &str, snapshot: &str) -> CoreResult<Lsn> {
        let shared = &self.shared;
        let _lock = shared.catalog.modification_lock();
        let logger = shared.logger()?;
        let db = shared
            .catalog
            .by_name(database)
            .ok_or_else(|| CoreError::no_such_database(database))?;
        if !shared.snapshots.exists(&shared.dir, db.id(), snapshot) {
            return Err(CoreError::NoSuchSnapshot {
                database: database.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        let _ticket = shared.gate.enter();
        let payload = SnapshotDeleted {
            database_name: database.to_string(),
            snapshot_name: snapshot.to_string(),
        }
        .encode()?;
        let lsn = logger.append(PayloadType::SnapshotDelete, payload)?;
        shared.snapshots.remove(&shared.dir, db.id(), snapshot)?;

        info!(database, snapshot, lsn = %lsn, "snapshot deleted");
        Ok(lsn)
    }

    /// Returns a snapshot of a database.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` or `NoSuchSnapshot` if either is missing.
    pub fn get_snapshot(&self, database: &str, snapshot: &str) -> CoreResult<Arc<PersistentSnapshot>> {
        let shared = &self.shared;
        let db = shared
            .catalog
            .by_name(database)
            .ok_or_else(|| CoreError::no_such_database(database))?;
        shared
            .snapshots
            .load(&shared.dir, db.id(), database, snapshot)
    }

    /// Looks up a key in a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase`, `NoSuchSnapshot` or `NoSuchIndex`.
    pub fn snapshot_lookup(
        &self,
        database: &str,
        snapshot: &str,
        index: usize,
        key: &[u8],
    ) -> CoreResult<Option<Vec<u8>>> {
        self.get_snapshot(database, snapshot)?.get(index, key)
    }

    /// Lists the snapshot names of a database.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchDatabase` if the database does not exist.
    pub fn list_snapshots(&self, database: &str) -> CoreResult<Vec<String>> {
        let db = self
            .shared
            .catalog
            .by_name(database)
            .ok_or_else(|| CoreError::no_such_database(database))?;
        self.shared.dir.list_snapshots(db.id())
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use replidb_storage::MemoryIndexStore;
    use tempfile::tempdir;

    fn store() -> MemoryIndexStore {
        let store = MemoryIndexStore::new(3);
        store.put(0, b"user:1", b"ada").unwrap();
        store.put(0, b"user:2", b"bob").unwrap();
        store.put(1, b"email", b"x").unwrap();
        store.put(2, b"user:9", b"skip").unwrap();
        store
    }

    #[test]
    fn write_then_load_from_disk() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let db = DatabaseId::new(1);
        let config = SnapshotConfig::new("nightly", vec![0, 2]);

        SnapshotStore::new()
            .write(&engine_dir, db, Lsn::new(1, 7), config.clone(), &store())
            .unwrap();

        // A fresh store has nothing cached and must read the file
        let loaded = SnapshotStore::new()
            .load(&engine_dir, db, "main", "nightly")
            .unwrap();
        assert_eq!(loaded.lsn(), Lsn::new(1, 7));
        assert_eq!(loaded.config(), &config);
        assert_eq!(loaded.get(0, b"user:1").unwrap(), Some(b"ada".to_vec()));
        assert_eq!(loaded.prefix_scan(2, b"user:").unwrap().len(), 1);
        assert!(matches!(
            loaded.get(1, b"email"),
            Err(CoreError::NoSuchIndex { .. })
        ));
    }

    #[test]
    fn snapshot_is_frozen() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let live = store();
        let snapshot = SnapshotStore::new()
            .write(
                &engine_dir,
                DatabaseId::new(1),
                Lsn::new(1, 2),
                SnapshotConfig::new("s", vec![0]),
                &live,
            )
            .unwrap();
        live.put(0, b"user:3", b"cy").unwrap();
        assert_eq!(snapshot.prefix_scan(0, b"user:").unwrap().len(), 2);
    }

    #[test]
    fn missing_and_removed_snapshots() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let snapshots = SnapshotStore::new();
        let db = DatabaseId::new(2);

        assert!(matches!(
            snapshots.load(&engine_dir, db, "main", "nope"),
            Err(CoreError::NoSuchSnapshot { .. })
        ));
        snapshots
            .write(&engine_dir, db, Lsn::FIRST, SnapshotConfig::new("a", vec![1]), &store())
            .unwrap();
        assert!(snapshots.exists(&engine_dir, db, "a"));
        assert!(snapshots.remove(&engine_dir, db, "a").unwrap());
        assert!(!snapshots.remove(&engine_dir, db, "a").unwrap());
        assert!(snapshots.load(&engine_dir, db, "main", "a").is_err());
    }

    #[test]
    fn corrupted_file_is_rejected() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let db = DatabaseId::new(1);
        SnapshotStore::new()
            .write(&engine_dir, db, Lsn::FIRST, SnapshotConfig::new("s", vec![0]), &store())
            .unwrap();

        let path = engine_dir.snapshot_path(db, "s");
        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x01;
        fs::write(&path, data).unwrap();

        assert!(matches!(
            SnapshotStore::new().load(&engine_dir, db, "main", "s"),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn validates_names_and_indices() {
        assert!(SnapshotConfig::new("ok-1", vec![0]).validate(1, "db").is_ok());
        assert!(SnapshotConfig::new("", vec![]).validate(1, "db").is_err());
        assert!(SnapshotConfig::new("../x", vec![]).validate(1, "db").is_err());
        assert!(matches!(
            SnapshotConfig::new("s", vec![0, 4]).validate(2, "db"),
            Err(CoreError::NoSuchIndex { index: 4, .. })
        ));
    }
}
