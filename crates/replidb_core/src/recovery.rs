//! Crash recovery: replaying log segments into the stores.
//!
//! Replay starts from the smallest checkpoint mark across all databases.
//! Segments that end before that point are never opened. Every entry at or
//! after the start is decoded and dispatched to a [`ReplaySink`]; structural
//! markers only advance the resume position.
//!
//! ## Failure
//!
//! A truncated or corrupt entry anywhere in the stream aborts recovery. A
//! torn tail is not trimmed: skipping entries could let replicas diverge.

use crate::error::{CoreError, CoreResult};
use crate::insert::InsertRecordGroup;
use crate::types::Lsn;
use crate::wal::{list_segments, prune_before, PayloadType, SnapshotCreated, SnapshotDeleted};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Receives the replayable entries in LSN order.
pub trait ReplaySink {
    /// Applies an insert record group.
    ///
    /// # Errors
    ///
    /// Any error aborts recovery.
    fn insert(&mut self, lsn: Lsn, group: InsertRecordGroup) -> CoreResult<()>;

    /// Recreates a snapshot without logging it again.
    ///
    /// # Errors
    ///
    /// Any error aborts recovery.
    fn snapshot_create(&mut self, lsn: Lsn, created: SnapshotCreated) -> CoreResult<()>;

    /// Removes a snapshot without logging it again.
    ///
    /// # Errors
    ///
    /// Any error aborts recovery.
    fn snapshot_delete(&mut self, lsn: Lsn, deleted: SnapshotDeleted) -> CoreResult<()>;
}

/// A sink that discards everything. Payloads are still decoded, so a
/// replay into it validates the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReplaySink for NullSink {
    fn insert(&mut self, _lsn: Lsn, _group: InsertRecordGroup) -> CoreResult<()> {
        Ok(())
    }

    fn snapshot_create(&mut self, _lsn: Lsn, _created: SnapshotCreated) -> CoreResult<()> {
        Ok(())
    }

    fn snapshot_delete(&mut self, _lsn: Lsn, _deleted: SnapshotDeleted) -> CoreResult<()> {
        Ok(())
    }
}

/// Result of a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Position replay started from.
    pub start: Lsn,
    /// LSN the logger resumes at.
    pub next_lsn: Lsn,
    /// Entries dispatched to the sink.
    pub replayed: u64,
    /// Entries read at or after `start` but ignored (structural markers).
    pub ignored: u64,
    /// Segment files opened.
    pub segments_read: usize,
}

/// Computes where replay starts from the databases' checkpoint marks.
///
/// No databases means `(0, 0)`: replay everything. Otherwise the smallest
/// mark plus one, never in view 0.
///
/// ```rust
/// use replidb_core::{recovery_start, Lsn};
///
/// assert_eq!(recovery_start(&[]).unwrap(), Lsn::ZERO);
/// assert_eq!(recovery_start(&[Lsn::new(1, 10), Lsn::new(1, 7)]).unwrap(), Lsn::new(1, 8));
/// assert_eq!(recovery_start(&[Lsn::ZERO]).unwrap(), Lsn::FIRST);
/// ```
#[must_use]
pub fn recovery_start(marks: &[Lsn]) -> CoreResult<Lsn> {
    match marks.iter().min() {
        None => Ok(Lsn::ZERO),
        Some(min) => {
            let start = Lsn::new(min.view_id().max(1), min.sequence_no());
            following(start)
        }
    }
}

/// The LSN after `lsn`, failing for a sequence number that cannot grow.
///
/// # Errors
///
/// Returns `InvalidFormat` when `lsn` has the largest sequence number.
pub(crate) fn following(lsn: Lsn) -> CoreResult<Lsn> {
    lsn.checked_next()
        .ok_or_else(|| CoreError::invalid_format(format!("lsn {lsn} has no successor")))
}

/// Replays the segments of one log directory.
#[derive(Debug, Clone)]
pub struct LogReplayer {
    dir: PathBuf,
}

impl LogReplayer {
    /// Creates a replayer for `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Replays every entry at or after `from` into `sink`.
    ///
    /// `next_lsn` in the outcome is one past the last entry read, `(1, 1)`
    /// for an empty log, and never less than `from`.
    ///
    /// # Errors
    ///
    /// - `CorruptLogEntry` for a truncated, corrupt or out-of-order entry
    /// - `MalformedPayload` for an entry whose payload cannot be decoded
    /// - any error returned by the sink
    pub fn replay(&self, from: Lsn, sink: &mut dyn ReplaySink) -> CoreResult<ReplayOutcome> {
        let segments = prune_before(list_segments(&self.dir)?, from);
        info!(from = %from, segments = segments.len(), dir = %self.dir.display(), "recovery started");

        let mut last: Option<Lsn> = None;
        let mut replayed = 0u64;
        let mut ignored = 0u64;

        for segment in &segments {
            debug!(segment = %segment.path().display(), "replaying segment");
            let mut reader = segment.open()?;
            loop {
                let offset = reader.offset();
                let Some(entry) = reader.next() else {
                    break;
                };
                let entry = entry?;
                let lsn = entry.lsn();

                if let Some(previous) = last {
                    if lsn <= previous {
                        return Err(CoreError::corrupt_log_entry(
                            segment.path(),
                            offset,
                            format!("lsn {lsn} does not follow {previous}"),
                        ));
                    }
                }
                if lsn < from {
                    continue;
                }
                last = Some(lsn);

                match entry.payload_type() {
                    PayloadType::Insert => {
                        let group = InsertRecordGroup::decode(entry.payload())?;
                        sink.insert(lsn, group)?;
                        replayed += 1;
                    }
                    PayloadType::SnapshotCreate => {
                        sink.snapshot_create(lsn, SnapshotCreated::decode(entry.payload())?)?;
                        replayed += 1;
                    }
                    PayloadType::SnapshotDelete => {
                        sink.snapshot_delete(lsn, SnapshotDeleted::decode(entry.payload())?)?;
                        replayed += 1;
                    }
                    PayloadType::DatabaseCreate
                    | PayloadType::DatabaseCopy
                    | PayloadType::DatabaseDelete => ignored += 1,
                }
            }
        }

        let next_lsn = match last {
            Some(last) => following(last)?,
            None => Lsn::FIRST,
        }
        .max(from);
        info!(from = %from, next = %next_lsn, replayed, ignored, "recovery complete");
        Ok(ReplayOutcome {
            start: from,
            next_lsn,
            replayed,
            ignored,
            segments_read: segments.len(),
        })
    }
}
