//! Log segment files: naming, enumeration, streaming reads and reclamation.
//!
//! Each segment is named after the LSN of its first entry,
//! `<viewId>.<sequenceNo>.log`, and holds a contiguous LSN range.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::entry::{EntryHeader, LogEntry, ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE};
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension of log segments.
pub const SEGMENT_EXTENSION: &str = "log";

/// Read buffer size for segment scans.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A segment file identified by its start LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    start: Lsn,
    path: PathBuf,
}

impl SegmentName {
    /// Builds the name for a segment starting at `start` inside `dir`.
    #[must_use]
    pub fn new(dir: &Path, start: Lsn) -> Self {
        Self {
            start,
            path: dir.join(Self::file_name(start)),
        }
    }

    /// Returns the file name for a segment starting at `start`.
    #[must_use]
    pub fn file_name(start: Lsn) -> String {
        format!(
            "{}.{}.{}",
            start.view_id(),
            start.sequence_no(),
            SEGMENT_EXTENSION
        )
    }

    /// Parses a file name of the form `<view>.<seq>.log`.
    ///
    /// Returns `None` for anything else, including names with leading signs
    /// or extra components.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Lsn> {
        let stem = file_name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
        let (view, seq) = stem.split_once('.')?;
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(view) || !digits(seq) {
            return None;
        }
        Some(Lsn::new(view.parse().ok()?, seq.parse().ok()?))
    }

    /// Returns the LSN of the first entry in the segment.
    #[must_use]
    pub fn start(&self) -> Lsn {
        self.start
    }

    /// Returns the segment's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a streaming reader over this segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(&self) -> CoreResult<SegmentReader> {
        SegmentReader::open(&self.path)
    }
}

/// Lists the segments in `dir`, ordered by start LSN.
///
/// Files that do not follow the segment naming pattern are ignored. A
/// missing directory yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_segments(dir: &Path) -> CoreResult<Vec<SegmentName>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(start) = SegmentName::parse(name) {
            segments.push(SegmentName {
                start,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(SegmentName::start);
    Ok(segments)
}

/// Drops every segment whose successor still starts at or before `from`.
///
/// What remains is the segment that may contain `from` and everything after
/// it. Segments are not opened.
#[must_use]
pub fn prune_before(mut segments: Vec<SegmentName>, from: Lsn) -> Vec<SegmentName> {
    let mut skip = 0;
    while skip + 1 < segments.len() && segments[skip + 1].start() <= from {
        skip += 1;
    }
    segments.drain(..skip);
    segments
}

/// Deletes every closed segment whose entries are all at or below `mark`.
///
/// A segment qualifies when its successor starts at or before `mark + 1`.
/// The newest segment has no successor, so it is read to find its last
/// entry. `active` is never deleted.
///
/// Returns the deleted paths.
///
/// # Errors
///
/// Returns an error if listing, reading or removing a file fails.
pub fn delete_segments_through(
    dir: &Path,
    mark: Lsn,
    active: Option<&Path>,
) -> CoreResult<Vec<PathBuf>> {
    let segments = list_segments(dir)?;
    let mut deleted = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        if active == Some(segment.path()) {
            continue;
        }
        let covered = match segments.get(i + 1) {
            Some(successor) => successor.start() <= mark.next(),
            None => {
                segment.start() <= mark
                    && SegmentReader::last_lsn(segment.path())?.map_or(true, |last| last <= mark)
            }
        };
        if !covered {
            break;
        }
        fs::remove_file(segment.path())?;
        debug!(segment = %segment.path().display(), "deleted log segment");
        deleted.push(segment.path().to_path_buf());
    }
    if !deleted.is_empty() {
        info!(count = deleted.len(), mark = %mark, "reclaimed log segments");
    }
    Ok(deleted)
}

/// Streams the entries of one segment file.
///
/// Each yielded entry owns its payload; dropping it releases the memory.
/// A header or payload cut short by end-of-file, a checksum mismatch or an
/// unknown payload type is reported as [`CoreError::CorruptLogEntry`] and
/// ends the iteration.
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    len: u64,
    offset: u64,
    finished: bool,
}

impl SegmentReader {
    /// Opens `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            len,
            offset: 0,
            finished: false,
        })
    }

    /// Returns the byte offset of the next entry.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the LSN of the last readable entry, reading the whole file.
    ///
    /// # Errors
    ///
    /// Returns the first corruption encountered.
    pub fn last_lsn(path: &Path) -> CoreResult<Option<Lsn>> {
        let mut last = None;
        for entry in Self::open(path)? {
            last = Some(entry?.lsn());
        }
        Ok(last)
    }

    fn corrupt(&self, reason: impl Into<String>) -> CoreError {
        CoreError::corrupt_log_entry(&self.path, self.offset, reason)
    }

    /// Fills `buf` completely. `Ok(false)` means a clean end-of-file before
    /// the first byte; a partial fill is a truncation error.
    fn fill(&mut self, buf: &mut [u8], what: &str) -> CoreResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == buf.len() {
            return Ok(true);
        }
        if filled == 0 && what == "header" {
            return Ok(false);
        }
        Err(self.corrupt(format!(
            "truncated {what}: expected {} bytes, found {filled}",
            buf.len()
        )))
    }

    fn read_entry(&mut self) -> CoreResult<Option<LogEntry>> {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        if !self.fill(&mut header, "header")? {
            return Ok(None);
        }
        let parsed = EntryHeader::parse(&header);

        let remaining = self
            .len
            .saturating_sub(self.offset + ENTRY_HEADER_SIZE as u64);
        if u64::from(parsed.payload_len) + ENTRY_CRC_SIZE as u64 > remaining {
            return Err(self.corrupt(format!(
                "truncated payload: length {} exceeds the {remaining} bytes left",
                parsed.payload_len
            )));
        }
        let mut payload = vec![0u8; parsed.payload_len as usize];
        self.fill(&mut payload, "payload")?;

        let mut crc = [0u8; ENTRY_CRC_SIZE];
        self.fill(&mut crc, "checksum")?;

        let entry = parsed
            .finish(&header, payload, u32::from_le_bytes(crc))
            .map_err(|reason| self.corrupt(reason))?;
        self.offset += entry.encoded_len() as u64;
        Ok(Some(entry))
    }
}

impl Iterator for SegmentReader {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::PayloadType;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_segment(dir: &Path, lsns: &[Lsn]) -> PathBuf {
        let path = SegmentName::new(dir, lsns[0]).path().to_path_buf();
        let mut file = File::create(&path).unwrap();
        for &lsn in lsns {
            let entry = LogEntry::new(lsn, PayloadType::Insert, vec![lsn.sequence_no() as u8; 3]);
            file.write_all(&entry.encode().unwrap()).unwrap();
        }
        path
    }

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn parse_names() {
        assert_eq!(SegmentName::parse("1.1.log"), Some(Lsn::new(1, 1)));
        assert_eq!(SegmentName::parse("12.3400.log"), Some(Lsn::new(12, 3400)));
        assert_eq!(SegmentName::parse("1.1.log.tmp"), None);
        assert_eq!(SegmentName::parse("1.log"), None);
        assert_eq!(SegmentName::parse("+1.2.log"), None);
        assert_eq!(SegmentName::parse("a.2.log"), None);
        assert_eq!(SegmentName::parse("1.2.3.log"), None);
        assert_eq!(SegmentName::file_name(Lsn::new(3, 17)), "3.17.log");
    }

    #[test]
    fn list_orders_numerically_and_ignores_strangers() {
        let dir = tempdir().unwrap();
        for name in ["1.10.log", "1.9.log", "2.1.log", "1.1.log", "notes.txt", "DBCONFIG"] {
            touch(dir.path(), name);
        }
        let starts: Vec<_> = list_segments(dir.path())
            .unwrap()
            .iter()
            .map(SegmentName::start)
            .collect();
        assert_eq!(
            starts,
            vec![Lsn::new(1, 1), Lsn::new(1, 9), Lsn::new(1, 10), Lsn::new(2, 1)]
        );
    }

    #[test]
    fn list_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(list_segments(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_segment_containing_from() {
        let dir = tempdir().unwrap();
        for name in ["1.1.log", "1.5.log", "1.9.log"] {
            touch(dir.path(), name);
        }
        let segments = list_segments(dir.path()).unwrap();

        let kept = prune_before(segments.clone(), Lsn::new(1, 6));
        assert_eq!(kept[0].start(), Lsn::new(1, 5));
        assert_eq!(kept.len(), 2);

        // Exactly on a boundary keeps only the segment starting there
        let kept = prune_before(segments.clone(), Lsn::new(1, 9));
        assert_eq!(kept.len(), 1);

        let kept = prune_before(segments, Lsn::ZERO);
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn read_entries_in_order() {
        let dir = tempdir().unwrap();
        let lsns: Vec<_> = (1..=5).map(|s| Lsn::new(1, s)).collect();
        let path = write_segment(dir.path(), &lsns);

        let read: Vec<_> = SegmentReader::open(&path)
            .unwrap()
            .map(|e| e.unwrap().lsn())
            .collect();
        assert_eq!(read, lsns);
        assert_eq!(SegmentReader::last_lsn(&path).unwrap(), Some(Lsn::new(1, 5)));
    }

    #[test]
    fn torn_tail_is_corruption() {
        let dir = tempdir().unwrap();
        let path = write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);

        // Simulate crash mid-write of the second entry
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        match err {
            CoreError::CorruptLogEntry { offset, reason, .. } => {
                assert_eq!(offset, 24);
                assert!(reason.contains("truncated"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_segment_has_no_entries() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "1.1.log");
        let path = dir.path().join("1.1.log");
        assert_eq!(SegmentReader::open(&path).unwrap().count(), 0);
        assert_eq!(SegmentReader::last_lsn(&path).unwrap(), None);
    }

    #[test]
    fn delete_through_mark() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);
        write_segment(dir.path(), &[Lsn::new(1, 3), Lsn::new(1, 4)]);
        write_segment(dir.path(), &[Lsn::new(1, 5)]);

        // Mark inside the second segment: only the first is wholly covered
        let deleted = delete_segments_through(dir.path(), Lsn::new(1, 3), None).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("1.1.log"));

        // Mark at the end of the second segment
        let deleted = delete_segments_through(dir.path(), Lsn::new(1, 4), None).unwrap();
        assert_eq!(deleted.len(), 1);
        let left: Vec<_> = list_segments(dir.path()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].start(), Lsn::new(1, 5));

        // A closed newest segment goes once the mark covers its last entry
        let deleted = delete_segments_through(dir.path(), Lsn::new(1, 5), None).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(list_segments(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn delete_skips_active_segment() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1)]);
        let active = write_segment(dir.path(), &[Lsn::new(1, 2), Lsn::new(1, 3)]);

        let deleted =
            delete_segments_through(dir.path(), Lsn::new(1, 3), Some(active.as_path())).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(active.exists());
    }

    #[test]
    fn delete_keeps_newest_segment_past_the_mark() {
        let dir = tempdir().unwrap();
        let newest = write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);

        let deleted = delete_segments_through(dir.path(), Lsn::new(1, 1), None).unwrap();
        assert!(deleted.is_empty());
        assert!(newest.exists());
    }

    proptest! {
        #[test]
        fn any_flipped_byte_is_detected(at in 0usize..64, mask in 1u8..=255) {
            let dir = tempdir().unwrap();
            let path = write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);
            let mut bytes = std::fs::read(&path).unwrap();
            let at = at % bytes.len();
            bytes[at] ^= mask;
            std::fs::write(&path, &bytes).unwrap();

            let read: CoreResult<Vec<LogEntry>> = SegmentReader::open(&path).unwrap().collect();
            prop_assert!(read.is_err());
        }
    }
}
