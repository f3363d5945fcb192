//! Verify command implementation.

use replidb_core::wal::list_segments;
use replidb_core::{CoreError, LogReplayer, Lsn, NullSink};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of entries that read and decoded cleanly.
    pub valid_entries: u64,
    /// First error found.
    pub error: Option<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Checks every segment in `dir`.
///
/// Replaying into a [`NullSink`] checks checksums, LSN ordering and payload
/// decoding in one pass.
pub fn verify(dir: &Path) -> Result<VerifyResult, CoreError> {
    let segments_checked = list_segments(dir)?.len();
    let outcome = LogReplayer::new(dir).replay(Lsn::ZERO, &mut NullSink);
    Ok(match outcome {
        Ok(outcome) => VerifyResult {
            segments_checked,
            valid_entries: outcome.replayed + outcome.ignored,
            error: None,
        },
        Err(e) => VerifyResult {
            segments_checked,
            valid_entries: 0,
            error: Some(e.to_string()),
        },
    })
}

/// Runs the verify command.
pub fn run(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying log at {}", dir.display());
    println!();

    let result = verify(dir)?;
    println!("  Segments checked: {}", result.segments_checked);
    if let Some(error) = &result.error {
        println!("  Error: {error}");
    } else {
        println!("  Entries: {}", result.valid_entries);
    }

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err("Verification failed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::write_segment;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn clean_log_passes() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2)]);
        write_segment(dir.path(), &[Lsn::new(1, 3)]);

        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.segments_checked, 2);
        assert_eq!(result.valid_entries, 3);
    }

    #[test]
    fn empty_log_passes() {
        let dir = tempdir().unwrap();
        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.segments_checked, 0);
    }

    #[test]
    fn out_of_order_lsns_fail() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 3), Lsn::new(1, 2)]);

        let result = verify(dir.path()).unwrap();
        assert!(!result.is_ok());
        assert!(result.error.unwrap().contains("does not follow"));
    }

    #[test]
    fn torn_tail_fails() {
        let dir = tempdir().unwrap();
        let path = write_segment(dir.path(), &[Lsn::new(1, 1)]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xFF; 7]).unwrap();

        assert!(!verify(dir.path()).unwrap().is_ok());
    }
}
