//! Engine directory management.
//!
//! ```text
//! <base_dir>/
//! ├─ LOCK                     # Advisory lock for single-process access
//! ├─ DBCONFIG                 # Database registry
//! ├─ checkpoints/<id>.ckpt    # Per-database checkpoint mark + index image
//! └─ snapshots/<id>/<name>.snap
//! <log_dir>/
//! └─ <view>.<seq>.log         # Log segments
//! ```

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::registry::DatabaseRegistry;
use crate::types::DatabaseId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const REGISTRY_FILE: &str = "DBCONFIG";
const CHECKPOINTS_DIR: &str = "checkpoints";
const SNAPSHOTS_DIR: &str = "snapshots";
const CHECKPOINT_EXTENSION: &str = "ckpt";
const SNAPSHOT_EXTENSION: &str = "snap";
const TEMP_SUFFIX: &str = ".tmp";

/// The engine's on-disk layout, holding an exclusive lock on the base directory.
#[derive(Debug)]
pub struct EngineDir {
    base: PathBuf,
    log_dir: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Creates missing directories and takes the exclusive lock.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another process holds the lock
    /// - `InvalidFormat` if the base path is not a directory
    /// - `Io` on any file system failure
    pub fn open(config: &Config) -> CoreResult<Self> {
        let base = config.base_dir.clone();
        fs::create_dir_all(&base)?;
        if !base.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                base.display()
            )));
        }
        fs::create_dir_all(&config.log_dir)?;
        fs::create_dir_all(base.join(CHECKPOINTS_DIR))?;
        fs::create_dir_all(base.join(SNAPSHOTS_DIR))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(base.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            base,
            log_dir: config.log_dir.clone(),
            _lock_file: lock_file,
        })
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the log directory.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Returns the path of the registry file.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.base.join(REGISTRY_FILE)
    }

    /// Returns the path of a database's checkpoint file.
    #[must_use]
    pub fn checkpoint_path(&self, id: DatabaseId) -> PathBuf {
        self.base
            .join(CHECKPOINTS_DIR)
            .join(format!("{}.{CHECKPOINT_EXTENSION}", id.as_u32()))
    }

    /// Returns the directory holding a database's snapshots.
    #[must_use]
    pub fn snapshot_dir(&self, id: DatabaseId) -> PathBuf {
        self.base.join(SNAPSHOTS_DIR).join(id.as_u32().to_string())
    }

    /// Returns the path of one snapshot file.
    #[must_use]
    pub fn snapshot_path(&self, id: DatabaseId, name: &str) -> PathBuf {
        self.snapshot_dir(id)
            .join(format!("{name}.{SNAPSHOT_EXTENSION}"))
    }

    /// Lists the snapshot names stored for a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub fn list_snapshots(&self, id: DatabaseId) -> CoreResult<Vec<String>> {
        let entries = match fs::read_dir(self.snapshot_dir(id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Loads the registry. Returns `None` for a new engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load_registry(&self) -> CoreResult<Option<DatabaseRegistry>> {
        match fs::read(self.registry_path()) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => DatabaseRegistry::decode(&data).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the registry atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any write, sync or rename fails.
    pub fn save_registry(&self, registry: &DatabaseRegistry) -> CoreResult<()> {
        write_atomic(&self.registry_path(), &registry.encode()?)?;
        Ok(())
    }

    /// Removes a database's checkpoint file and snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub fn remove_database_files(&self, id: DatabaseId) -> CoreResult<()> {
        match fs::remove_file(self.checkpoint_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir_all(self.snapshot_dir(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        sync_directory(&self.base.join(CHECKPOINTS_DIR))?;
        Ok(())
    }
}

/// Writes `data` to `path` via a temporary file, fsync and rename.
///
/// The parent directory is fsynced afterwards so the rename survives a crash.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

/// Fsyncs a directory so entry creations, renames and deletions are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// NTFS journals metadata; there is no directory handle to fsync.
#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatabaseRecord;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("db"));
        let engine_dir = EngineDir::open(&config).unwrap();

        assert!(engine_dir.base().join("LOCK").exists());
        assert!(engine_dir.log_dir().is_dir());
        assert!(engine_dir.base().join("checkpoints").is_dir());
        assert!(engine_dir.base().join("snapshots").is_dir());
        assert_eq!(
            engine_dir.checkpoint_path(DatabaseId::new(4)),
            engine_dir.base().join("checkpoints").join("4.ckpt")
        );
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let _first = EngineDir::open(&config).unwrap();
        assert!(matches!(
            EngineDir::open(&config),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        drop(EngineDir::open(&config).unwrap());
        assert!(EngineDir::open(&config).is_ok());
    }

    #[test]
    fn registry_persists() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let engine_dir = EngineDir::open(&config).unwrap();
        assert!(engine_dir.load_registry().unwrap().is_none());

        let mut registry = DatabaseRegistry::new();
        let id = registry.allocate_id();
        registry
            .insert(DatabaseRecord::new(id, "users", 2))
            .unwrap();
        engine_dir.save_registry(&registry).unwrap();

        let loaded = engine_dir.load_registry().unwrap().unwrap();
        assert_eq!(loaded.by_name("users").unwrap().num_indices, 2);
        assert!(!engine_dir.base().join("DBCONFIG.tmp").exists());
    }

    #[test]
    fn list_snapshots_filters_extension() {
        let dir = tempdir().unwrap();
        let engine_dir = EngineDir::open(&Config::new(dir.path())).unwrap();
        let id = DatabaseId::new(1);
        fs::create_dir_all(engine_dir.snapshot_dir(id)).unwrap();
        fs::write(engine_dir.snapshot_path(id, "b"), b"").unwrap();
        fs::write(engine_dir.snapshot_path(id, "a"), b"").unwrap();
        fs::write(engine_dir.snapshot_dir(id).join("a.snap.tmp"), b"").unwrap();

        assert_eq!(engine_dir.list_snapshots(id).unwrap(), vec!["a", "b"]);
        engine_dir.remove_database_files(id).unwrap();
        assert!(engine_dir.list_snapshots(id).unwrap().is_empty());
    }
}
