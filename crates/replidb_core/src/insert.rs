//! Insert record groups: batched mutations for one database.

use crate::error::CoreResult;
use crate::types::DatabaseId;
use crate::wal::PayloadReader;

/// One key mutation inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    /// Target index.
    pub index: u32,
    /// Key bytes.
    pub key: Vec<u8>,
    /// New value, or `None` to delete the key.
    pub value: Option<Vec<u8>>,
}

/// A batch of mutations applied atomically under one LSN.
///
/// ```rust
/// use replidb_core::{DatabaseId, InsertRecordGroup};
///
/// let mut group = InsertRecordGroup::new(DatabaseId::new(1));
/// group.add_insert(0, b"k".to_vec(), b"v".to_vec());
/// group.add_delete(1, b"old".to_vec());
/// assert_eq!(group.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecordGroup {
    database_id: DatabaseId,
    records: Vec<InsertRecord>,
}

impl InsertRecordGroup {
    /// Creates an empty group for a database.
    #[must_use]
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            records: Vec::new(),
        }
    }

    /// Returns the target database.
    #[must_use]
    pub fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Returns the records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[InsertRecord] {
        &self.records
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the group holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a key/value insertion.
    pub fn add_insert(&mut self, index: u32, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.records.push(InsertRecord {
            index,
            key,
            value: Some(value),
        });
        self
    }

    /// Adds a key deletion.
    pub fn add_delete(&mut self, index: u32, key: Vec<u8>) -> &mut Self {
        self.records.push(InsertRecord {
            index,
            key,
            value: None,
        });
        self
    }

    /// Highest index referenced by the group.
    #[must_use]
    pub fn max_index(&self) -> Option<u32> {
        self.records.iter().map(|r| r.index).max()
    }

    /// Encodes the group.
    ///
    /// ```text
    /// | db_id (4) | count (4) | per record: index (4) | key_len (4) | key |
    /// |   has_value (1) | [value_len (4) | value] |
    /// ```
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.database_id.as_u32().to_le_bytes());
        buf.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for record in &self.records {
            buf.extend_from_slice(&record.index.to_le_bytes());
            buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record.key);
            match &record.value {
                Some(value) => {
                    buf.push(1);
                    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    buf.extend_from_slice(value);
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Decodes a group produced by [`InsertRecordGroup::encode`].
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` on truncation or trailing bytes.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let database_id = DatabaseId::new(reader.u32()?);
        let count = reader.u32()? as usize;

        let mut records = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let index = reader.u32()?;
            let key_len = reader.u32()? as usize;
            let key = reader.bytes(key_len)?.to_vec();
            let value = match reader.u8()? {
                0 => None,
                _ => {
                    let value_len = reader.u32()? as usize;
                    Some(reader.bytes(value_len)?.to_vec())
                }
            };
            records.push(InsertRecord { index, key, value });
        }
        reader.finish("insert")?;

        Ok(Self {
            database_id,
            records,
        })
    }
}
