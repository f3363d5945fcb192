//! CLI command implementations.

pub mod dump;
pub mod recover;
pub mod segments;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil {
    use replidb_core::wal::{LogEntry, PayloadType, SegmentName};
    use replidb_core::{DatabaseId, InsertRecordGroup, Lsn};
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// Writes a segment of insert entries for database 1.
    pub fn write_segment(dir: &Path, lsns: &[Lsn]) -> PathBuf {
        let path = SegmentName::new(dir, lsns[0]).path().to_path_buf();
        let mut file = File::create(&path).unwrap();
        for &lsn in lsns {
            let mut group = InsertRecordGroup::new(DatabaseId::new(1));
            group.add_insert(0, lsn.to_string().into_bytes(), b"v".to_vec());
            let entry = LogEntry::new(lsn, PayloadType::Insert, group.encode());
            file.write_all(&entry.encode().unwrap()).unwrap();
        }
        path
    }
}
