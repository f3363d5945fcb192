//! Log entries and their on-disk framing.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;

/// Header size: view (4) + sequence (8) + type (1) + length (4).
pub const ENTRY_HEADER_SIZE: usize = 17;

/// CRC trailer size.
pub const ENTRY_CRC_SIZE: usize = 4;

/// What a log entry's payload describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// A batch of key/value mutations for one database.
    Insert = 0,
    /// A persistent snapshot was created.
    SnapshotCreate = 1,
    /// A database was created.
    DatabaseCreate = 2,
    /// A database was copied.
    DatabaseCopy = 3,
    /// A database was deleted.
    DatabaseDelete = 4,
    /// A persistent snapshot was deleted.
    SnapshotDelete = 5,
}

impl PayloadType {
    /// Converts a byte to a payload type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Insert),
            1 => Some(Self::SnapshotCreate),
            2 => Some(Self::DatabaseCreate),
            3 => Some(Self::DatabaseCopy),
            4 => Some(Self::DatabaseDelete),
            5 => Some(Self::SnapshotDelete),
            _ => None,
        }
    }

    /// Converts the payload type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short lowercase name, used by tooling output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::SnapshotCreate => "snapshot-create",
            Self::DatabaseCreate => "database-create",
            Self::DatabaseCopy => "database-copy",
            Self::DatabaseDelete => "database-delete",
            Self::SnapshotDelete => "snapshot-delete",
        }
    }

    /// Returns true for entries that change state during replay.
    ///
    /// Database create/copy/delete markers are structural: the registry is
    /// persisted synchronously, so replay has nothing to redo for them.
    #[must_use]
    pub const fn is_replayed(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::SnapshotCreate | Self::SnapshotDelete
        )
    }
}

/// One immutable record of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    lsn: Lsn,
    payload_type: PayloadType,
    payload: Vec<u8>,
}

impl LogEntry {
    /// Maximum payload size representable by the 4-byte length field.
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Creates an entry.
    #[must_use]
    pub fn new(lsn: Lsn, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        Self {
            lsn,
            payload_type,
            payload,
        }
    }

    /// Returns the entry's LSN.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Returns the payload type.
    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the entry and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Number of bytes the encoded entry occupies on disk.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.payload.len() + ENTRY_CRC_SIZE
    }

    /// Encodes the entry with its header and CRC trailer.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds [`Self::MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            CoreError::invalid_argument(format!(
                "log payload too large: {} bytes exceeds maximum of {} bytes",
                self.payload.len(),
                Self::MAX_PAYLOAD_SIZE
            ))
        })?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.lsn.view_id().to_le_bytes());
        buf.extend_from_slice(&self.lsn.sequence_no().to_le_bytes());
        buf.push(self.payload_type.as_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// A decoded entry header, before the payload has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// LSN stored in the header.
    pub lsn: Lsn,
    /// Raw payload type byte.
    pub type_byte: u8,
    /// Length of the payload that follows.
    pub payload_len: u32,
}

impl EntryHeader {
    /// Parses the fixed-size header.
    #[must_use]
    pub fn parse(bytes: &[u8; ENTRY_HEADER_SIZE]) -> Self {
        let mut view = [0u8; 4];
        view.copy_from_slice(&bytes[0..4]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[4..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[13..17]);
        Self {
            lsn: Lsn::new(u32::from_le_bytes(view), u64::from_le_bytes(seq)),
            type_byte: bytes[12],
            payload_len: u32::from_le_bytes(len),
        }
    }

    /// Validates the CRC and payload type and assembles the entry.
    ///
    /// Returns a human-readable reason on failure; the caller adds the
    /// file and offset.
    pub fn finish(
        self,
        header: &[u8; ENTRY_HEADER_SIZE],
        payload: Vec<u8>,
        stored_crc: u32,
    ) -> Result<LogEntry, String> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        hasher.update(&payload);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(format!(
                "checksum mismatch: expected {stored_crc:08x}, got {computed:08x}"
            ));
        }

        let payload_type = PayloadType::from_byte(self.type_byte)
            .ok_or_else(|| format!("unknown payload type {}", self.type_byte))?;

        Ok(LogEntry::new(self.lsn, payload_type, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(encoded: &[u8]) -> ([u8; ENTRY_HEADER_SIZE], Vec<u8>, u32) {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        header.copy_from_slice(&encoded[..ENTRY_HEADER_SIZE]);
        let crc_at = encoded.len() - ENTRY_CRC_SIZE;
        let payload = encoded[ENTRY_HEADER_SIZE..crc_at].to_vec();
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&encoded[crc_at..]);
        (header, payload, u32::from_le_bytes(crc))
    }

    #[test]
    fn header_layout() {
        let entry = LogEntry::new(Lsn::new(2, 5), PayloadType::SnapshotDelete, vec![9, 9, 9]);
        let encoded = entry.encode().unwrap();
        assert_eq!(encoded.len(), entry.encoded_len());

        let (header, payload, crc) = split(&encoded);
        let parsed = EntryHeader::parse(&header);
        assert_eq!(parsed.lsn, Lsn::new(2, 5));
        assert_eq!(parsed.type_byte, 5);
        assert_eq!(parsed.payload_len, 3);
        assert_eq!(parsed.finish(&header, payload, crc).unwrap(), entry);
    }

    #[test]
    fn rejects_flipped_payload_bit() {
        let encoded = LogEntry::new(Lsn::FIRST, PayloadType::Insert, vec![1, 2, 3])
            .encode()
            .unwrap();
        let (header, mut payload, crc) = split(&encoded);
        payload[1] ^= 0x80;
        let reason = EntryHeader::parse(&header)
            .finish(&header, payload, crc)
            .unwrap_err();
        assert!(reason.contains("checksum"));
    }

    #[test]
    fn rejects_unknown_type_with_valid_crc() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.push(200);
        raw.extend_from_slice(&0u32.to_le_bytes());
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());

        let (header, payload, crc) = split(&raw);
        let reason = EntryHeader::parse(&header)
            .finish(&header, payload, crc)
            .unwrap_err();
        assert!(reason.contains("unknown payload type 200"));
    }

    #[test]
    fn structural_markers_are_not_replayed() {
        assert!(PayloadType::Insert.is_replayed());
        assert!(PayloadType::SnapshotCreate.is_replayed());
        assert!(PayloadType::SnapshotDelete.is_replayed());
        assert!(!PayloadType::DatabaseCreate.is_replayed());
        assert!(!PayloadType::DatabaseCopy.is_replayed());
        assert!(!PayloadType::DatabaseDelete.is_replayed());
    }
}
