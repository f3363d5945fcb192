//! Frozen index images and their binary encoding.
//!
//! ```text
//! | magic (4) | version (2) | num_indices (4) |
//! | per index: count (8) | per entry: key_len (4) | key | value_len (4) | value |
//! | crc32 (4) |
//! ```
//!
//! The CRC covers every byte before it.

use crate::error::{StorageError, StorageResult};
use std::collections::BTreeMap;

/// Magic bytes identifying an encoded index image.
pub const IMAGE_MAGIC: [u8; 4] = *b"RIMG";

/// Current image format version.
pub const IMAGE_VERSION: u16 = 1;

const CRC_SIZE: usize = 4;

/// A point-in-time copy of every index of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexImage {
    indices: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl IndexImage {
    /// Creates an image with `num_indices` empty indices.
    #[must_use]
    pub fn empty(num_indices: usize) -> Self {
        Self {
            indices: vec![BTreeMap::new(); num_indices],
        }
    }

    /// Wraps already materialized index maps.
    #[must_use]
    pub fn from_indices(indices: Vec<BTreeMap<Vec<u8>, Vec<u8>>>) -> Self {
        Self { indices }
    }

    /// Returns the number of indices in the image.
    #[must_use]
    pub fn num_indices(&self) -> usize {
        self.indices.len()
    }

    /// Returns the total number of entries across all indices.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.indices.iter().map(BTreeMap::len).sum()
    }

    /// Returns the map for one index, if it exists.
    #[must_use]
    pub fn index(&self, index: usize) -> Option<&BTreeMap<Vec<u8>, Vec<u8>>> {
        self.indices.get(index)
    }

    /// Keeps only the listed indices; all others become empty.
    ///
    /// Out-of-range entries in `keep` are ignored.
    #[must_use]
    pub fn retain_indices(mut self, keep: &[usize]) -> Self {
        for (i, map) in self.indices.iter_mut().enumerate() {
            if !keep.contains(&i) {
                map.clear();
            }
        }
        self
    }

    /// Consumes the image and returns the raw index maps.
    #[must_use]
    pub fn into_indices(self) -> Vec<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.indices
    }

    /// Encodes the image.
    ///
    /// # Errors
    ///
    /// Returns an error if a key or value is larger than 4 GiB.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&IMAGE_MAGIC);
        buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());

        let count = u32::try_from(self.indices.len())
            .map_err(|_| StorageError::corrupted("too many indices"))?;
        buf.extend_from_slice(&count.to_le_bytes());

        for map in &self.indices {
            buf.extend_from_slice(&(map.len() as u64).to_le_bytes());
            for (key, value) in map {
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes an image produced by [`IndexImage::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] on a bad magic, unknown version,
    /// checksum mismatch, truncation or trailing bytes.
    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < IMAGE_MAGIC.len() + 2 + 4 + CRC_SIZE {
            return Err(StorageError::corrupted("image too short"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - CRC_SIZE);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(StorageError::corrupted(format!(
                "image checksum mismatch: expected {stored:08x}, got {computed:08x}"
            )));
        }

        if body[0..4] != IMAGE_MAGIC {
            return Err(StorageError::corrupted("invalid image magic"));
        }
        let mut cursor = 4;

        let read = |cursor: &mut usize, len: usize| -> StorageResult<&[u8]> {
            if *cursor + len > body.len() {
                return Err(StorageError::corrupted("unexpected end of image"));
            }
            let slice = &body[*cursor..*cursor + len];
            *cursor += len;
            Ok(slice)
        };
        let read_u32 = |cursor: &mut usize| -> StorageResult<u32> {
            let bytes = read(cursor, 4)?;
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };

        let version_bytes = read(&mut cursor, 2)?;
        let version = u16::from_le_bytes([version_bytes[0], version_bytes[1]]);
        if version > IMAGE_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported image version: {version}"
            )));
        }

        let num_indices = read_u32(&mut cursor)? as usize;
        let mut indices = Vec::with_capacity(num_indices.min(1024));
        for _ in 0..num_indices {
            let count_bytes = read(&mut cursor, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(count_bytes);
            let count = u64::from_le_bytes(raw);

            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key_len = read_u32(&mut cursor)? as usize;
                let key = read(&mut cursor, key_len)?.to_vec();
                let value_len = read_u32(&mut cursor)? as usize;
                let value = read(&mut cursor, value_len)?.to_vec();
                map.insert(key, value);
            }
            indices.push(map);
        }

        if cursor != body.len() {
            return Err(StorageError::corrupted(format!(
                "trailing bytes in image: expected {} bytes, got {}",
                cursor,
                body.len()
            )));
        }

        Ok(Self { indices })
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> StorageResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StorageError::corrupted("key or value exceeds 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}
