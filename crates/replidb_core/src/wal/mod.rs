//! Write-ahead log: entries, segment files and the logger.
//!
//! Every mutation is appended to the log under a fresh LSN before it is
//! applied. The log is split into segment files named after the LSN of
//! their first entry, so recovery can order and prune them without opening
//! them.
//!
//! ## Entry Format
//!
//! ```text
//! | view (4) | sequence (8) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.
//!
//! ## Invariants
//!
//! - LSNs are assigned under one lock and written in that order
//! - Within a view, sequence numbers have no gaps
//! - Only the active segment is ever appended to
//! - A segment is deleted only after a checkpoint covers all its entries

mod entry;
mod logger;
mod payload;
mod segment;

pub use entry::{EntryHeader, LogEntry, PayloadType, ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE};
pub use logger::DiskLogger;
pub(crate) use payload::{put_name_u16, PayloadReader};
pub use payload::{DatabaseMarker, SnapshotCreated, SnapshotDeleted};
pub use segment::{
    delete_segments_through, list_segments, prune_before, SegmentName, SegmentReader,
    SEGMENT_EXTENSION,
};
