//! Recover command implementation.
//!
//! Dry run of log replay: reads every entry from the given position and
//! reports where the logger would resume. Nothing is written.

use replidb_core::{LogReplayer, Lsn, NullSink, ReplayOutcome};
use std::path::Path;

/// Replays `dir` from `from` into a discarding sink.
pub fn dry_run(dir: &Path, from: Lsn) -> Result<ReplayOutcome, Box<dyn std::error::Error>> {
    Ok(LogReplayer::new(dir).replay(from, &mut NullSink)?)
}

/// Runs the recover command.
pub fn run(dir: &Path, from: Lsn) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = dry_run(dir, from)?;
    println!("Replay from:     {}", outcome.start);
    println!("Segments read:   {}", outcome.segments_read);
    println!("Entries applied: {}", outcome.replayed);
    println!("Entries skipped: {}", outcome.ignored);
    println!("Next LSN:        {}", outcome.next_lsn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::write_segment;
    use tempfile::tempdir;

    #[test]
    fn empty_log_resumes_at_first() {
        let dir = tempdir().unwrap();
        let outcome = dry_run(dir.path(), Lsn::ZERO).unwrap();
        assert_eq!(outcome.next_lsn, Lsn::FIRST);
        assert_eq!(outcome.replayed, 0);
    }

    #[test]
    fn resumes_after_last_entry() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), &[Lsn::new(1, 1), Lsn::new(1, 2), Lsn::new(1, 3)]);
        write_segment(dir.path(), &[Lsn::new(1, 4), Lsn::new(1, 5)]);

        let outcome = dry_run(dir.path(), Lsn::new(1, 4)).unwrap();
        assert_eq!(outcome.replayed, 2);
        assert_eq!(outcome.segments_read, 1);
        assert_eq!(outcome.next_lsn, Lsn::new(1, 6));
    }
}
