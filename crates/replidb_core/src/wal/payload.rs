//! Payload encodings for snapshot and database marker entries.

use crate::error::{CoreError, CoreResult};
use crate::snapshot::SnapshotConfig;
use crate::types::{DatabaseId, Lsn};

/// Reads little-endian fields out of a payload, failing on truncation.
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.cursor + len > self.data.len() {
            return Err(CoreError::malformed_payload("unexpected end of payload"));
        }
        let slice = &self.data[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn lsn(&mut self) -> CoreResult<Lsn> {
        let view = self.u32()?;
        let seq = self.u64()?;
        Ok(Lsn::new(view, seq))
    }

    pub(crate) fn string(&mut self, len: usize) -> CoreResult<String> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::malformed_payload("name is not valid UTF-8"))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.cursor..];
        self.cursor = self.data.len();
        slice
    }

    pub(crate) fn finish(self, what: &str) -> CoreResult<()> {
        if self.cursor != self.data.len() {
            return Err(CoreError::malformed_payload(format!(
                "trailing bytes in {what} payload: expected {} bytes, got {}",
                self.cursor,
                self.data.len()
            )));
        }
        Ok(())
    }
}

pub(crate) fn put_name_u16(buf: &mut Vec<u8>, name: &str) -> CoreResult<()> {
    let len = u16::try_from(name.len())
        .map_err(|_| CoreError::invalid_argument(format!("name too long: {} bytes", name.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

/// Payload of a `SnapshotCreate` entry: the database and the snapshot to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCreated {
    /// Database the snapshot belongs to.
    pub database: DatabaseId,
    /// Snapshot descriptor.
    pub config: SnapshotConfig,
}

impl SnapshotCreated {
    /// Encodes as `db_id:u32 | config`.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.database.as_u32().to_le_bytes());
        self.config.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a `SnapshotCreate` payload.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let database = DatabaseId::new(reader.u32()?);
        let config = SnapshotConfig::decode_from(&mut reader)?;
        reader.finish("snapshot-create")?;
        Ok(Self { database, config })
    }
}

/// Payload of a `SnapshotDelete` entry.
///
/// Layout: `name_len:u8 | database_name | snapshot_name`. The snapshot name
/// takes the remainder of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDeleted {
    /// Name of the database.
    pub database_name: String,
    /// Name of the snapshot.
    pub snapshot_name: String,
}

impl SnapshotDeleted {
    /// Encodes the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the database name is longer than 255 bytes.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let len = u8::try_from(self.database_name.len()).map_err(|_| {
            CoreError::invalid_argument("database name longer than 255 bytes cannot be logged")
        })?;
        let mut buf = Vec::with_capacity(1 + self.database_name.len() + self.snapshot_name.len());
        buf.push(len);
        buf.extend_from_slice(self.database_name.as_bytes());
        buf.extend_from_slice(self.snapshot_name.as_bytes());
        Ok(buf)
    }

    /// Decodes a `SnapshotDelete` payload.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let len = reader.u8()? as usize;
        let database_name = reader.string(len)?;
        let rest = reader.rest();
        let snapshot_name = String::from_utf8(rest.to_vec())
            .map_err(|_| CoreError::malformed_payload("snapshot name is not valid UTF-8"))?;
        Ok(Self {
            database_name,
            snapshot_name,
        })
    }
}

/// Payload of the structural database entries.
///
/// These are written for auditing and tooling; replay skips them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseMarker {
    /// `DatabaseCreate`: `id:u32 | num_indices:u32 | name`.
    Created {
        /// New database id.
        id: DatabaseId,
        /// Index count.
        num_indices: u32,
        /// Database name.
        name: String,
    },
    /// `DatabaseCopy`: `source:u32 | dest:u32 | dest_name`.
    Copied {
        /// Source database id.
        source: DatabaseId,
        /// Destination database id.
        dest: DatabaseId,
        /// Destination name.
        dest_name: String,
    },
    /// `DatabaseDelete`: `id:u32 | name`.
    Deleted {
        /// Deleted database id.
        id: DatabaseId,
        /// Deleted database name.
        name: String,
    },
}

impl DatabaseMarker {
    /// Encodes the marker payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Created {
                id,
                num_indices,
                name,
            } => {
                buf.extend_from_slice(&id.as_u32().to_le_bytes());
                buf.extend_from_slice(&num_indices.to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
            Self::Copied {
                source,
                dest,
                dest_name,
            } => {
                buf.extend_from_slice(&source.as_u32().to_le_bytes());
                buf.extend_from_slice(&dest.as_u32().to_le_bytes());
                buf.extend_from_slice(dest_name.as_bytes());
            }
            Self::Deleted { id, name } => {
                buf.extend_from_slice(&id.as_u32().to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf
    }

    /// Decodes a marker of the given kind.
    ///
    /// `kind` must be one of the database payload types.
    pub fn decode(kind: super::PayloadType, payload: &[u8]) -> CoreResult<Self> {
        use super::PayloadType;

        let mut reader = PayloadReader::new(payload);
        let to_string = |raw: &[u8]| {
            String::from_utf8(raw.to_vec())
                .map_err(|_| CoreError::malformed_payload("name is not valid UTF-8"))
        };
        match kind {
            PayloadType::DatabaseCreate => {
                let id = DatabaseId::new(reader.u32()?);
                let num_indices = reader.u32()?;
                let name = to_string(reader.rest())?;
                Ok(Self::Created {
                    id,
                    num_indices,
                    name,
                })
            }
            PayloadType::DatabaseCopy => {
                let source = DatabaseId::new(reader.u32()?);
                let dest = DatabaseId::new(reader.u32()?);
                let dest_name = to_string(reader.rest())?;
                Ok(Self::Copied {
                    source,
                    dest,
                    dest_name,
                })
            }
            PayloadType::DatabaseDelete => {
                let id = DatabaseId::new(reader.u32()?);
                let name = to_string(reader.rest())?;
                Ok(Self::Deleted { id, name })
            }
            other => Err(CoreError::malformed_payload(format!(
                "{} is not a database marker",
                other.name()
            ))),
        }
    }

    /// Payload type this marker is logged under.
    #[must_use]
    pub fn payload_type(&self) -> super::PayloadType {
        match self {
            Self::Created { .. } => super::PayloadType::DatabaseCreate,
            Self::Copied { .. } => super::PayloadType::DatabaseCopy,
            Self::Deleted { .. } => super::PayloadType::DatabaseDelete,
        }
    }
}
