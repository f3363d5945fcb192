//! Segments command implementation.

use crate::Format;
use replidb_core::wal::{list_segments, SegmentReader};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// One row of the segment listing.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// File name of the segment.
    pub file: String,
    /// LSN of the first entry, taken from the file name.
    pub first_lsn: String,
    /// LSN of the last readable entry.
    pub last_lsn: Option<String>,
    /// Size on disk.
    pub size_bytes: u64,
    /// First corruption found while reading, if any.
    pub error: Option<String>,
}

/// Collects segment information for `dir`, oldest first.
pub fn collect(dir: &Path) -> Result<Vec<SegmentInfo>, Box<dyn std::error::Error>> {
    let mut rows = Vec::new();
    for segment in list_segments(dir)? {
        let path = segment.path();
        let size_bytes = fs::metadata(path)?.len();
        let (last_lsn, error) = match SegmentReader::last_lsn(path) {
            Ok(last) => (last.map(|lsn| lsn.to_string()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        rows.push(SegmentInfo {
            file: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            first_lsn: segment.start().to_string(),
            last_lsn,
            size_bytes,
            error,
        });
    }
    Ok(rows)
}

/// Runs the segments command.
pub fn run(dir: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let rows = collect(dir)?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Log directory: {}", dir.display());
    println!("Segments: {}", rows.len());
    println!();
    println!("{:<28} {:>12} {:>12} {:>12}", "FILE", "FIRST", "LAST", "BYTES");
    for row in &rows {
        println!(
            "{:<28} {:>12} {:>12} {:>12}",
            row.file,
            row.first_lsn,
            row.last_lsn.as_deref().unwrap_or("-"),
            row.size_bytes
        );
        if let Some(error) = &row.error {
            println!("  ! {error}");
        }
    }
    let total: u64 = rows.iter().map(|r| r.size_bytes).sum();
    println!();
    println!("Total: {total} bytes");
    Ok(())
}
