//! # replidb Storage
//!
//! The indexed store that log entries are ultimately applied to.
//!
//! Every database owns a fixed number of indices. Each index is an ordered
//! map from byte keys to byte values. The engine never inspects how a store
//! keeps its data; it only needs point lookups, prefix scans, mutations and
//! the ability to freeze a point-in-time [`IndexImage`] for checkpoints and
//! snapshots.
//!
//! ## Available Stores
//!
//! - [`MemoryIndexStore`] - B-tree maps guarded by a read/write lock
//!
//! ## Example
//!
//! ```rust
//! use replidb_storage::{IndexStore, MemoryIndexStore};
//!
//! let store = MemoryIndexStore::new(2);
//! store.put(0, b"alpha", b"1").unwrap();
//! assert_eq!(store.get(0, b"alpha").unwrap(), Some(b"1".to_vec()));
//! assert!(store.get(1, b"alpha").unwrap().is_none());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod image;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use image::{IndexImage, IMAGE_MAGIC, IMAGE_VERSION};
pub use memory::MemoryIndexStore;
pub use store::{IndexStore, KeyValue};
