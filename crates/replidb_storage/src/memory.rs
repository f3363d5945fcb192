//! In-memory indexed store.

use crate::error::{StorageError, StorageResult};
use crate::image::IndexImage;
use crate::store::{IndexStore, KeyValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// An indexed store backed by one `BTreeMap` per index.
///
/// All indices share a single read/write lock, so `freeze` observes every
/// index at the same instant.
///
/// # Example
///
/// ```rust
/// use replidb_storage::{IndexStore, MemoryIndexStore};
///
/// let store = MemoryIndexStore::new(1);
/// store.put(0, b"user:1", b"ada").unwrap();
/// store.put(0, b"user:2", b"grace").unwrap();
/// store.put(0, b"group:1", b"admins").unwrap();
///
/// let users = store.prefix_scan(0, b"user:").unwrap();
/// assert_eq!(users.len(), 2);
/// ```
#[derive(Debug)]
pub struct MemoryIndexStore {
    indices: RwLock<Vec<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryIndexStore {
    /// Creates an empty store with `num_indices` indices.
    #[must_use]
    pub fn new(num_indices: usize) -> Self {
        Self {
            indices: RwLock::new(vec![BTreeMap::new(); num_indices]),
        }
    }

    /// Creates a store holding the contents of `image`.
    #[must_use]
    pub fn from_image(image: IndexImage) -> Self {
        Self {
            indices: RwLock::new(image.into_indices()),
        }
    }

    /// Returns the total number of entries across all indices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.read().iter().map(BTreeMap::len).sum()
    }

    /// Returns true if no index holds any entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_index(count: usize, index: usize) -> StorageResult<()> {
        if index >= count {
            return Err(StorageError::NoSuchIndex { index, count });
        }
        Ok(())
    }
}

impl IndexStore for MemoryIndexStore {
    fn num_indices(&self) -> usize {
        self.indices.read().len()
    }

    fn put(&self, index: usize, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut indices = self.indices.write();
        Self::check_index(indices.len(), index)?;
        indices[index].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, index: usize, key: &[u8]) -> StorageResult<()> {
        let mut indices = self.indices.write();
        Self::check_index(indices.len(), index)?;
        indices[index].remove(key);
        Ok(())
    }

    fn get(&self, index: usize, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let indices = self.indices.read();
        Self::check_index(indices.len(), index)?;
        Ok(indices[index].get(key).cloned())
    }

    fn prefix_scan(&self, index: usize, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let indices = self.indices.read();
        Self::check_index(indices.len(), index)?;
        let range = indices[index].range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded));
        Ok(range
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn freeze(&self) -> IndexImage {
        IndexImage::from_indices(self.indices.read().clone())
    }

    fn load(&self, image: IndexImage) -> StorageResult<()> {
        let mut indices = self.indices.write();
        if image.num_indices() != indices.len() {
            return Err(StorageError::ShapeMismatch {
                expected: indices.len(),
                actual: image.num_indices(),
            });
        }
        *indices = image.into_indices();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = MemoryIndexStore::new(2);
        store.put(1, b"k", b"v1").unwrap();
        store.put(1, b"k", b"v2").unwrap();
        assert_eq!(store.get(1, b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get(0, b"k").unwrap(), None);

        store.remove(1, b"k").unwrap();
        assert!(store.get(1, b"k").unwrap().is_none());

        // Removing again is a no-op
        store.remove(1, b"k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn index_out_of_range() {
        let store = MemoryIndexStore::new(1);
        let err = store.put(3, b"k", b"v").unwrap_err();
        assert!(matches!(err, StorageError::NoSuchIndex { index: 3, count: 1 }));
        assert!(store.get(1, b"k").is_err());
        assert!(store.prefix_scan(1, b"").is_err());
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let store = MemoryIndexStore::new(1);
        for key in ["b:2", "a:1", "b:1", "c:1", "b:3"] {
            store.put(0, key.as_bytes(), b"x").unwrap();
        }

        let keys: Vec<_> = store
            .prefix_scan(0, b"b:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, vec!["b:1", "b:2", "b:3"]);

        assert_eq!(store.prefix_scan(0, b"").unwrap().len(), 5);
        assert!(store.prefix_scan(0, b"z").unwrap().is_empty());
    }

    #[test]
    fn freeze_is_isolated_from_later_writes() {
        let store = MemoryIndexStore::new(1);
        store.put(0, b"a", b"1").unwrap();
        let image = store.freeze();
        store.put(0, b"b", b"2").unwrap();

        assert_eq!(image.entry_count(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_replaces_contents() {
        let source = MemoryIndexStore::new(2);
        source.put(1, b"x", b"y").unwrap();

        let target = MemoryIndexStore::new(2);
        target.put(0, b"stale", b"1").unwrap();
        target.load(source.freeze()).unwrap();

        assert!(target.get(0, b"stale").unwrap().is_none());
        assert_eq!(target.get(1, b"x").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn load_rejects_shape_mismatch() {
        let target = MemoryIndexStore::new(3);
        let err = target.load(MemoryIndexStore::new(2).freeze()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::ShapeMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
