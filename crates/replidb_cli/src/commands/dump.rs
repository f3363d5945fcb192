//! Dump command implementation.

use crate::Format;
use replidb_core::wal::{
    list_segments, prune_before, DatabaseMarker, LogEntry, PayloadType, SnapshotCreated,
    SnapshotDeleted,
};
use replidb_core::{InsertRecordGroup, Lsn};
use serde::Serialize;
use std::path::Path;

/// A decoded log entry, ready for printing.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Entry LSN.
    pub lsn: String,
    /// Payload type name.
    pub kind: &'static str,
    /// Encoded size including header and checksum.
    pub size_bytes: usize,
    /// One-line summary of the payload.
    pub summary: String,
}

/// Reads entries at or after `from`, up to `limit`.
///
/// # Errors
///
/// Fails on the first corrupt entry or undecodable payload.
pub fn collect(
    dir: &Path,
    from: Option<Lsn>,
    limit: Option<usize>,
) -> Result<Vec<EntryInfo>, Box<dyn std::error::Error>> {
    let from = from.unwrap_or(Lsn::ZERO);
    let limit = limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();

    for segment in prune_before(list_segments(dir)?, from) {
        for entry in segment.open()? {
            let entry = entry?;
            if entry.lsn() < from {
                continue;
            }
            if out.len() >= limit {
                return Ok(out);
            }
            out.push(describe(&entry)?);
        }
    }
    Ok(out)
}

fn describe(entry: &LogEntry) -> Result<EntryInfo, Box<dyn std::error::Error>> {
    let kind = entry.payload_type();
    let summary = match kind {
        PayloadType::Insert => {
            let group = InsertRecordGroup::decode(entry.payload())?;
            format!("{} records={}", group.database_id(), group.len())
        }
        PayloadType::SnapshotCreate => {
            let created = SnapshotCreated::decode(entry.payload())?;
            format!(
                "{} snapshot={:?} indices={:?}",
                created.database, created.config.name, created.config.indices
            )
        }
        PayloadType::SnapshotDelete => {
            let deleted = SnapshotDeleted::decode(entry.payload())?;
            format!(
                "database={:?} snapshot={:?}",
                deleted.database_name, deleted.snapshot_name
            )
        }
        PayloadType::DatabaseCreate | PayloadType::DatabaseCopy | PayloadType::DatabaseDelete => {
            match DatabaseMarker::decode(kind, entry.payload())? {
                DatabaseMarker::Created {
                    id,
                    num_indices,
                    name,
                } => format!("{id} name={name:?} indices={num_indices}"),
                DatabaseMarker::Copied {
                    source,
                    dest,
                    dest_name,
                } => format!("{source} -> {dest} name={dest_name:?}"),
                DatabaseMarker::Deleted { id, name } => format!("{id} name={name:?}"),
            }
        }
    };

    Ok(EntryInfo {
        lsn: entry.lsn().to_string(),
        kind: kind.name(),
        size_bytes: entry.encoded_len(),
        summary,
    })
}

/// Runs the dump command.
pub fn run(
    dir: &Path,
    from: Option<Lsn>,
    limit: Option<usize>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(dir, from, limit)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for entry in &entries {
                println!(
                    "{:>12}  {:<16} {:>8}B  {}",
                    entry.lsn, entry.kind, entry.size_bytes, entry.summary
                );
            }
            println!();
            println!("{} entries", entries.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::write_segment;
    use replidb_core::DatabaseId;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn dumps_every_entry_in_order() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);
        write_segment(dir.path(), &[Lsn::new(1, 3)]);

        let entries = collect(dir.path(), None, None).unwrap();
        let lsns: Vec<_> = entries.iter().map(|e| e.lsn.as_str()).collect();
        assert_eq!(lsns, ["1.1", "1.2", "1.3"]);
        assert!(entries.iter().all(|e| e.kind == "insert"));
        assert_eq!(entries[0].summary, "db:1 records=1");
    }

    #[test]
    fn from_and_limit_bound_the_output() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);
        write_segment(dir.path(), &[Lsn::new(1, 3), Lsn::new(1, 4), Lsn::new(1, 5)]);

        let entries = collect(dir.path(), Some(Lsn::new(1, 2)), Some(2)).unwrap();
        let lsns: Vec<_> = entries.iter().map(|e| e.lsn.as_str()).collect();
        assert_eq!(lsns, ["1.2", "1.3"]);
    }

    #[test]
    fn structural_markers_are_described() {
        let dir = tempdir().unwrap();
        let marker = DatabaseMarker::Created {
            id: DatabaseId::new(7),
            num_indices: 2,
            name: "users".into(),
        };
        let entry = LogEntry::new(Lsn::FIRST, marker.payload_type(), marker.encode());
        let path = replidb_core::wal::SegmentName::new(dir.path(), Lsn::FIRST)
            .path()
            .to_path_buf();
        std::fs::write(&path, entry.encode().unwrap()).unwrap();

        let entries = collect(dir.path(), None, None).unwrap();
        assert_eq!(entries[0].kind, "database-create");
        assert_eq!(entries[0].summary, "db:7 name=\"users\" indices=2");
    }

    #[test]
    fn corruption_is_an_error() {
        let dir = tempdir().unwrap();
        let path = write_segment(dir.path(), &[Lsn::new(1, 1)]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        assert!(collect(dir.path(), None, None).is_err());
    }
}
