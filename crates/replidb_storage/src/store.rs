//! Indexed store trait definition.

use crate::error::StorageResult;
use crate::image::IndexImage;

/// A key/value pair returned by range queries.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// The storage collaborator that replayed and live log entries are applied to.
///
/// A store holds a fixed number of ordered indices. Index numbers are
/// zero-based and must be below [`IndexStore::num_indices`]; any other index
/// yields [`crate::StorageError::NoSuchIndex`].
///
/// # Invariants
///
/// - Keys within one index are kept in byte order
/// - `put` overwrites, `remove` of a missing key is a no-op
/// - `freeze` returns a copy that later mutations do not affect
/// - Stores must be `Send + Sync`; the engine applies and reads concurrently
pub trait IndexStore: Send + Sync {
    /// Returns the number of indices in this store.
    fn num_indices(&self) -> usize;

    /// Inserts or replaces `key` in `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    fn put(&self, index: usize, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key` from `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    fn remove(&self, index: usize, key: &[u8]) -> StorageResult<()>;

    /// Looks up `key` in `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    fn get(&self, index: usize, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns every entry of `index` whose key starts with `prefix`, in key order.
    ///
    /// An empty prefix returns the whole index.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range.
    fn prefix_scan(&self, index: usize, prefix: &[u8]) -> StorageResult<Vec<KeyValue>>;

    /// Captures a point-in-time copy of all indices.
    fn freeze(&self) -> IndexImage;

    /// Replaces the store contents with `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image has a different number of indices.
    fn load(&self, image: IndexImage) -> StorageResult<()>;
}
