//! Database registry: the persistent name/id/shape table.

use crate::error::{CoreError, CoreResult};
use crate::types::DatabaseId;
use crate::wal::{put_name_u16, PayloadReader};
use std::collections::BTreeMap;

/// Magic bytes for the registry file.
pub const REGISTRY_MAGIC: [u8; 4] = *b"RDBC";

/// Current registry version.
pub const REGISTRY_VERSION: u16 = 1;

/// One registered database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRecord {
    /// Database id.
    pub id: DatabaseId,
    /// Unique name.
    pub name: String,
    /// Number of indices, fixed at creation.
    pub num_indices: u32,
}

impl DatabaseRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(id: DatabaseId, name: impl Into<String>, num_indices: u32) -> Self {
        Self {
            id,
            name: name.into(),
            num_indices,
        }
    }
}

/// All registered databases plus the id counter.
#[derive(Debug, Clone)]
pub struct DatabaseRegistry {
    databases: BTreeMap<DatabaseId, DatabaseRecord>,
    next_db_id: u32,
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseRegistry {
    /// Creates an empty registry; the first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            databases: BTreeMap::new(),
            next_db_id: 1,
        }
    }

    /// Returns the id the next created database will receive.
    #[must_use]
    pub fn next_db_id(&self) -> u32 {
        self.next_db_id
    }

    /// Overrides the id counter.
    pub fn set_next_db_id(&mut self, id: u32) {
        self.next_db_id = id;
    }

    /// Takes the next id and advances the counter.
    pub fn allocate_id(&mut self) -> DatabaseId {
        let id = DatabaseId::new(self.next_db_id);
        self.next_db_id += 1;
        id
    }

    /// Registers a database.
    ///
    /// A record with an existing id replaces it. The counter is bumped past
    /// the record's id so ids are never reused.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseExists` if another id already uses the name.
    pub fn insert(&mut self, record: DatabaseRecord) -> CoreResult<()> {
        if let Some(existing) = self.by_name(&record.name) {
            if existing.id != record.id {
                return Err(CoreError::DatabaseExists { name: record.name });
            }
        }
        if record.id.as_u32() >= self.next_db_id {
            self.next_db_id = record.id.as_u32() + 1;
        }
        self.databases.insert(record.id, record);
        Ok(())
    }

    /// Removes a database by id.
    pub fn remove(&mut self, id: DatabaseId) -> Option<DatabaseRecord> {
        self.databases.remove(&id)
    }

    /// Looks up a database by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&DatabaseRecord> {
        self.databases.values().find(|r| r.name == name)
    }

    /// Looks up a database by id.
    #[must_use]
    pub fn by_id(&self, id: DatabaseId) -> Option<&DatabaseRecord> {
        self.databases.get(&id)
    }

    /// Iterates databases in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DatabaseRecord> {
        self.databases.values()
    }

    /// Returns all ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<DatabaseId> {
        self.databases.keys().copied().collect()
    }

    /// Returns the number of databases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    /// Returns true if no database is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Encodes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is longer than 65535 bytes.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REGISTRY_MAGIC);
        buf.extend_from_slice(&REGISTRY_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.next_db_id.to_le_bytes());
        buf.extend_from_slice(&(self.databases.len() as u32).to_le_bytes());
        for record in self.databases.values() {
            buf.extend_from_slice(&record.id.as_u32().to_le_bytes());
            buf.extend_from_slice(&record.num_indices.to_le_bytes());
            put_name_u16(&mut buf, &record.name)?;
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a bad magic, newer version, checksum
    /// mismatch or truncation.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < REGISTRY_MAGIC.len() + 4 || data[0..4] != REGISTRY_MAGIC {
            return Err(CoreError::invalid_format("invalid registry magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != stored {
            return Err(CoreError::invalid_format("registry checksum mismatch"));
        }

        let parse = || -> CoreResult<Self> {
            let mut reader = PayloadReader::new(&body[4..]);
            let version = reader.u16()?;
            if version > REGISTRY_VERSION {
                return Err(CoreError::invalid_format(format!(
                    "unsupported registry version: {version}"
                )));
            }
            let next_db_id = reader.u32()?;
            let count = reader.u32()?;

            let mut databases = BTreeMap::new();
            for _ in 0..count {
                let id = DatabaseId::new(reader.u32()?);
                let num_indices = reader.u32()?;
                let name_len = reader.u16()? as usize;
                let name = reader.string(name_len)?;
                databases.insert(id, DatabaseRecord::new(id, name, num_indices));
            }
            reader.finish("registry")?;
            Ok(Self {
                databases,
                next_db_id,
            })
        };

        parse().map_err(|e| match e {
            CoreError::MalformedPayload { message } => CoreError::invalid_format(message),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseRegistry {
        let mut registry = DatabaseRegistry::new();
        let users = registry.allocate_id();
        registry.insert(DatabaseRecord::new(users, "users", 2)).unwrap();
        let orders = registry.allocate_id();
        registry.insert(DatabaseRecord::new(orders, "orders", 1)).unwrap();
        registry
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let registry = sample();
        assert_eq!(registry.ids(), vec![DatabaseId::new(1), DatabaseId::new(2)]);
        assert_eq!(registry.next_db_id(), 3);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = sample();
        let id = registry.allocate_id();
        let err = registry
            .insert(DatabaseRecord::new(id, "users", 1))
            .unwrap_err();
        assert!(matches!(err, CoreError::DatabaseExists { .. }));
    }

    #[test]
    fn insert_bumps_counter_past_foreign_id() {
        let mut registry = sample();
        registry
            .insert(DatabaseRecord::new(DatabaseId::new(40), "imported", 1))
            .unwrap();
        assert_eq!(registry.next_db_id(), 41);
    }

    #[test]
    fn encode_decode() {
        let registry = sample();
        let decoded = DatabaseRegistry::decode(&registry.encode().unwrap()).unwrap();
        assert_eq!(decoded.next_db_id(), 3);
        assert_eq!(decoded.by_name("orders").unwrap().id, DatabaseId::new(2));
        assert_eq!(decoded.by_id(DatabaseId::new(1)).unwrap().num_indices, 2);
    }

    #[test]
    fn corruption_detected() {
        let mut data = sample().encode().unwrap();
        data[12] ^= 0xFF;
        assert!(matches!(
            DatabaseRegistry::decode(&data),
            Err(CoreError::InvalidFormat { .. })
        ));
        assert!(DatabaseRegistry::decode(b"nope").is_err());
    }
}
