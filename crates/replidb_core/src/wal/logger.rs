//! The write-ahead logger: one writer thread owning the active segment.
//!
//! Callers assign LSNs and enqueue entries under a single mutex, so queue
//! order is LSN order. The writer thread drains the queue in batches,
//! appends to the active segment and fsyncs according to the [`SyncMode`].

use crate::config::{Config, SyncMode};
use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::entry::{LogEntry, PayloadType};
use crate::wal::segment::SegmentName;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Upper bound on commands handled between two sync decisions.
const MAX_BATCH: usize = 1024;

enum Command {
    Append {
        entry: LogEntry,
        done: Option<Sender<CoreResult<()>>>,
    },
    Rotate {
        done: Sender<CoreResult<Lsn>>,
    },
    Shutdown,
}

struct Sequencer {
    next: Lsn,
    sender: Option<SyncSender<Command>>,
}

/// State shared between callers and the writer thread.
struct LoggerShared {
    last_written: Mutex<Lsn>,
    active: Mutex<Option<PathBuf>>,
    log_size: AtomicU64,
    failure: Mutex<Option<(io::ErrorKind, String)>>,
}

impl LoggerShared {
    fn check_failed(&self) -> CoreResult<()> {
        match &*self.failure.lock() {
            Some((kind, message)) => Err(CoreError::io_failure(*kind, message.clone())),
            None => Ok(()),
        }
    }
}

/// Appends log entries in strict LSN order.
///
/// # Durability
///
/// - [`SyncMode::Sync`]: `append` returns after the batch holding the entry is fsynced
/// - [`SyncMode::PseudoSync`]: `append` waits for the end of the group-commit window
/// - [`SyncMode::Async`]: `append` returns once the entry is queued
///
/// # Failure
///
/// A write or fsync error fails every waiter of the affected batch and every
/// later append with an I/O error. The logger does not retry.
pub struct DiskLogger {
    sequencer: Mutex<Sequencer>,
    shared: Arc<LoggerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    sync_mode: SyncMode,
    dir: PathBuf,
}

impl DiskLogger {
    /// Starts a logger writing to `config.log_dir`, handing out LSNs from `next`.
    ///
    /// No segment is created until the first append; it is named after that
    /// entry's LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the writer
    /// thread cannot be spawned.
    pub fn start(config: &Config, next: Lsn) -> CoreResult<Self> {
        fs::create_dir_all(&config.log_dir)?;

        let shared = Arc::new(LoggerShared {
            last_written: Mutex::new(next.prev()),
            active: Mutex::new(None),
            log_size: AtomicU64::new(0),
            failure: Mutex::new(None),
        });
        let (sender, receiver) = mpsc::sync_channel(config.logger_queue_capacity());

        let writer = Writer {
            dir: config.log_dir.clone(),
            max_file_size: config.max_log_file_size.max(1),
            sync_mode: config.sync_mode,
            async_interval: config.async_flush_interval,
            active: None,
            shared: Arc::clone(&shared),
            waiters: Vec::new(),
            window_start: None,
        };
        let handle = thread::Builder::new()
            .name("replidb-logger".to_string())
            .spawn(move || writer.run(&receiver))
            .map_err(|e| CoreError::SpawnFailed {
                name: "logger".to_string(),
                message: e.to_string(),
            })?;

        info!(next = %next, dir = %config.log_dir.display(), mode = ?config.sync_mode, "logger started");
        Ok(Self {
            sequencer: Mutex::new(Sequencer {
                next,
                sender: Some(sender),
            }),
            shared,
            handle: Mutex::new(Some(handle)),
            sync_mode: config.sync_mode,
            dir: config.log_dir.clone(),
        })
    }

    /// Appends an entry and returns its LSN once the sync mode is satisfied.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` after [`DiskLogger::shutdown`]
    /// - `Io` if the logger has failed or the entry's batch could not be written
    /// - `InvalidArgument` if the payload exceeds the 4 GiB framing limit
    pub fn append(&self, payload_type: PayloadType, payload: Vec<u8>) -> CoreResult<Lsn> {
        if payload.len() > LogEntry::MAX_PAYLOAD_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "log payload too large: {} bytes",
                payload.len()
            )));
        }
        self.shared.check_failed()?;

        let (done, wait) = match self.sync_mode {
            SyncMode::Async => (None, None),
            SyncMode::Sync | SyncMode::PseudoSync(_) => {
                let (tx, rx) = mpsc::channel();
                (Some(tx), Some(rx))
            }
        };

        let lsn = {
            let mut sequencer = self.sequencer.lock();
            let lsn = sequencer.next;
            let following = lsn.checked_next().ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "sequence numbers of view {} are exhausted",
                    lsn.view_id()
                ))
            })?;
            let sender = sequencer.sender.as_ref().ok_or(CoreError::ShuttingDown)?;
            let entry = LogEntry::new(lsn, payload_type, payload);
            sender
                .send(Command::Append { entry, done })
                .map_err(|_| CoreError::ShuttingDown)?;
            sequencer.next = following;
            lsn
        };

        if let Some(rx) = wait {
            rx.recv().map_err(|_| CoreError::ShuttingDown)??;
        }
        Ok(lsn)
    }

    /// Closes the active segment after everything queued before it is durable.
    ///
    /// Returns the LSN of the last entry written. The next append opens a new
    /// segment. On a stopped logger this returns the last written LSN
    /// without touching the disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn rotate(&self) -> CoreResult<Lsn> {
        let (tx, rx) = mpsc::channel();
        {
            let sequencer = self.sequencer.lock();
            let Some(sender) = sequencer.sender.as_ref() else {
                return Ok(*self.shared.last_written.lock());
            };
            if sender.send(Command::Rotate { done: tx }).is_err() {
                return Ok(*self.shared.last_written.lock());
            }
        }
        rx.recv().map_err(|_| CoreError::ShuttingDown)?
    }

    /// Switches to a new view; the next LSN becomes `(view, 1)`.
    ///
    /// The active segment is closed so the new view starts its own segment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `view` is greater than the current view.
    pub fn new_view(&self, view: u32) -> CoreResult<Lsn> {
        let (tx, rx) = mpsc::channel();
        {
            let mut sequencer = self.sequencer.lock();
            if view <= sequencer.next.view_id() {
                return Err(CoreError::invalid_argument(format!(
                    "view {view} does not follow current view {}",
                    sequencer.next.view_id()
                )));
            }
            let sender = sequencer.sender.as_ref().ok_or(CoreError::ShuttingDown)?;
            sender
                .send(Command::Rotate { done: tx })
                .map_err(|_| CoreError::ShuttingDown)?;
            sequencer.next = Lsn::new(view, 1);
        }
        rx.recv().map_err(|_| CoreError::ShuttingDown)??;
        info!(view, "logger switched view");
        Ok(Lsn::new(view, 1))
    }

    /// Returns the LSN the next append will receive.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.sequencer.lock().next
    }

    /// Returns the LSN of the most recently assigned entry.
    #[must_use]
    pub fn last_assigned_lsn(&self) -> Lsn {
        self.sequencer.lock().next.prev()
    }

    /// Returns the LSN of the last entry handed to the file system.
    #[must_use]
    pub fn last_written_lsn(&self) -> Lsn {
        *self.shared.last_written.lock()
    }

    /// Bytes appended since the last explicit [`DiskLogger::rotate`].
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.shared.log_size.load(Ordering::Acquire)
    }

    /// Path of the segment currently open for appends, if any.
    #[must_use]
    pub fn active_segment(&self) -> Option<PathBuf> {
        self.shared.active.lock().clone()
    }

    /// Returns the log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stops accepting appends. Queued entries are still written and synced.
    pub fn shutdown(&self) {
        let sender = self.sequencer.lock().sender.take();
        if let Some(sender) = sender {
            // A closed channel means the writer already exited
            let _ = sender.send(Command::Shutdown);
        }
    }

    /// Blocks until the writer thread has drained the queue and exited.
    ///
    /// # Errors
    ///
    /// Returns the logger's failure, if it failed, or an error if the writer
    /// thread panicked.
    pub fn wait_for_shutdown(&self) -> CoreResult<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| {
                CoreError::io_failure(io::ErrorKind::Other, "logger thread panicked")
            })?;
        }
        self.shared.check_failed()
    }
}

impl Drop for DiskLogger {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.wait_for_shutdown();
    }
}

impl std::fmt::Debug for DiskLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLogger")
            .field("dir", &self.dir)
            .field("sync_mode", &self.sync_mode)
            .finish_non_exhaustive()
    }
}

struct ActiveSegment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

/// Writer-thread state.
struct Writer {
    dir: PathBuf,
    max_file_size: u64,
    sync_mode: SyncMode,
    async_interval: Duration,
    active: Option<ActiveSegment>,
    shared: Arc<LoggerShared>,
    waiters: Vec<Sender<CoreResult<()>>>,
    /// When the oldest unsynced write happened.
    window_start: Option<Instant>,
}

impl Writer {
    fn run(mut self, receiver: &Receiver<Command>) {
        loop {
            let first = match self.sync_deadline() {
                None => match receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
                Some(wait) => match receiver.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        self.sync_pending();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            let mut stop = false;
            for command in std::iter::once(first).chain(receiver.try_iter().take(MAX_BATCH)) {
                match command {
                    Command::Append { entry, done } => self.append(entry, done),
                    Command::Rotate { done } => {
                        let result = self.close_active().map(|()| {
                            self.shared.log_size.store(0, Ordering::Release);
                            *self.shared.last_written.lock()
                        });
                        let _ = done.send(result);
                    }
                    Command::Shutdown => stop = true,
                }
            }

            let due = match self.sync_mode {
                SyncMode::Sync => true,
                SyncMode::PseudoSync(delay) => self.window_elapsed(delay),
                SyncMode::Async => self.window_elapsed(self.async_interval),
            };
            if due || stop {
                self.sync_pending();
            }
            if stop {
                break;
            }
        }

        if let Err(e) = self.close_active() {
            error!(error = %e, "failed to close log segment on shutdown");
        }
        debug!("logger writer exited");
    }

    /// How long the writer may block before the pending window must be synced.
    fn sync_deadline(&self) -> Option<Duration> {
        let start = self.window_start?;
        let period = match self.sync_mode {
            SyncMode::Sync => Duration::ZERO,
            SyncMode::PseudoSync(delay) => delay,
            SyncMode::Async => self.async_interval,
        };
        Some(period.saturating_sub(start.elapsed()))
    }

    fn window_elapsed(&self, period: Duration) -> bool {
        self.window_start
            .map_or(false, |start| start.elapsed() >= period)
    }

    fn append(&mut self, entry: LogEntry, done: Option<Sender<CoreResult<()>>>) {
        if let Err(e) = self.shared.check_failed() {
            if let Some(done) = done {
                let _ = done.send(Err(e));
            }
            return;
        }
        let needs_rotation = self
            .active
            .as_ref()
            .map_or(false, |active| active.size >= self.max_file_size);
        if needs_rotation {
            if let Err(e) = self.close_active() {
                if let Some(done) = done {
                    let _ = done.send(Err(e));
                }
                return;
            }
            debug!(next = %entry.lsn(), "segment reached size limit");
        }
        match self.write_entry(&entry) {
            Ok(()) => {
                if self.window_start.is_none() {
                    self.window_start = Some(Instant::now());
                }
                if let Some(done) = done {
                    self.waiters.push(done);
                }
            }
            Err(e) => {
                self.fail(&e);
                if let Some(done) = done {
                    let _ = done.send(Err(clone_io(&e)));
                }
            }
        }
    }

    fn write_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        if self.active.is_none() {
            self.open_segment(entry.lsn())?;
        }

        let bytes = entry
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        if let Some(active) = self.active.as_mut() {
            active.file.write_all(&bytes)?;
            active.size += bytes.len() as u64;
        }
        self.shared
            .log_size
            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
        *self.shared.last_written.lock() = entry.lsn();
        Ok(())
    }

    fn open_segment(&mut self, start: Lsn) -> io::Result<()> {
        let name = SegmentName::new(&self.dir, start);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(name.path())?;
        sync_directory(&self.dir)?;
        debug!(segment = %name.path().display(), "opened log segment");

        *self.shared.active.lock() = Some(name.path().to_path_buf());
        self.active = Some(ActiveSegment {
            path: name.path().to_path_buf(),
            file: BufWriter::new(file),
            size: 0,
        });
        Ok(())
    }

    /// Flushes and fsyncs the active segment, then releases its waiters.
    fn sync_pending(&mut self) {
        let result = match self.active.as_mut() {
            Some(active) => active
                .file
                .flush()
                .and_then(|()| active.file.get_ref().sync_data()),
            None => Ok(()),
        };
        self.window_start = None;
        match result {
            Ok(()) => {
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Syncs and closes the active segment.
    fn close_active(&mut self) -> CoreResult<()> {
        self.sync_pending();
        self.shared.check_failed()?;
        if let Some(active) = self.active.take() {
            debug!(segment = %active.path.display(), size = active.size, "closed log segment");
        }
        *self.shared.active.lock() = None;
        Ok(())
    }

    fn fail(&mut self, e: &io::Error) {
        error!(error = %e, "log write failed; logger refuses further appends");
        {
            let mut failure = self.shared.failure.lock();
            if failure.is_none() {
                *failure = Some((e.kind(), e.to_string()));
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(clone_io(e)));
        }
    }
}

fn clone_io(e: &io::Error) -> CoreError {
    CoreError::io_failure(e.kind(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::segment::{list_segments, SegmentReader};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(dir: &Path) -> Config {
        Config::new(dir).log_dir(dir.join("log"))
    }

    fn read_all(dir: &Path) -> Vec<Lsn> {
        let mut lsns = Vec::new();
        for segment in list_segments(dir).unwrap() {
            for entry in segment.open().unwrap() {
                lsns.push(entry.unwrap().lsn());
            }
        }
        lsns
    }

    #[test]
    fn sync_appends_are_sequential_and_durable() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let logger = DiskLogger::start(&config, Lsn::FIRST).unwrap();

        for expected in 1..=5 {
            let lsn = logger.append(PayloadType::Insert, vec![expected as u8]).unwrap();
            assert_eq!(lsn, Lsn::new(1, expected));
        }
        assert_eq!(logger.last_assigned_lsn(), Lsn::new(1, 5));
        assert_eq!(logger.next_lsn(), Lsn::new(1, 6));

        // Entries are on disk before shutdown
        assert_eq!(read_all(&config.log_dir).len(), 5);
        assert!(config.log_dir.join("1.1.log").exists());
    }

    #[test]
    fn concurrent_appends_get_unique_gapless_lsns() {
        let dir = tempdir().unwrap();
        let config = config(dir.path()).sync_mode(SyncMode::PseudoSync(Duration::from_millis(2)));
        let logger = Arc::new(DiskLogger::start(&config, Lsn::new(3, 10)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let logger = Arc::clone(&logger);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| logger.append(PayloadType::Insert, vec![0; 8]).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut lsns: Vec<Lsn> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        lsns.sort();

        let expected: Vec<_> = (10..110).map(|s| Lsn::new(3, s)).collect();
        assert_eq!(lsns, expected);

        // File order equals LSN order
        logger.shutdown();
        logger.wait_for_shutdown().unwrap();
        assert_eq!(read_all(&config.log_dir), expected);
    }

    #[test]
    fn async_shutdown_drains_queue() {
        let dir = tempdir().unwrap();
        let config = config(dir.path())
            .sync_mode(SyncMode::Async)
            .async_flush_interval(Duration::from_secs(60));
        let logger = DiskLogger::start(&config, Lsn::FIRST).unwrap();
        for _ in 0..50 {
            logger.append(PayloadType::Insert, vec![1, 2, 3]).unwrap();
        }
        logger.shutdown();
        logger.wait_for_shutdown().unwrap();

        assert_eq!(read_all(&config.log_dir).len(), 50);
        assert!(matches!(
            logger.append(PayloadType::Insert, Vec::new()),
            Err(CoreError::ShuttingDown)
        ));
    }

    #[test]
    fn size_rotation_splits_on_entry_boundaries() {
        let dir = tempdir().unwrap();
        // Each entry is 17 + 10 + 4 = 31 bytes; rotate once a file reaches 64
        let config = config(dir.path()).max_log_file_size(64);
        let logger = DiskLogger::start(&config, Lsn::FIRST).unwrap();
        for _ in 0..7 {
            logger.append(PayloadType::Insert, vec![0; 10]).unwrap();
        }

        let names: Vec<_> = list_segments(&config.log_dir)
            .unwrap()
            .iter()
            .map(|s| s.start())
            .collect();
        assert_eq!(
            names,
            vec![Lsn::new(1, 1), Lsn::new(1, 4), Lsn::new(1, 7)]
        );
        let expected: Vec<_> = (1..=7).map(|s| Lsn::new(1, s)).collect();
        assert_eq!(read_all(&config.log_dir), expected);
    }

    #[test]
    fn rotate_returns_last_written_and_resets_size() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let logger = DiskLogger::start(&config, Lsn::FIRST).unwrap();
        logger.append(PayloadType::Insert, vec![1]).unwrap();
        logger.append(PayloadType::Insert, vec![2]).unwrap();
        assert!(logger.log_size() > 0);

        assert_eq!(logger.rotate().unwrap(), Lsn::new(1, 2));
        assert_eq!(logger.log_size(), 0);
        assert!(logger.active_segment().is_none());

        logger.append(PayloadType::Insert, vec![3]).unwrap();
        assert!(config.log_dir.join("1.3.log").exists());
        assert_eq!(
            SegmentReader::last_lsn(&config.log_dir.join("1.1.log")).unwrap(),
            Some(Lsn::new(1, 2))
        );
    }

    #[test]
    fn rotate_after_shutdown_reports_last_written() {
        let dir = tempdir().unwrap();
        let logger = DiskLogger::start(&config(dir.path()), Lsn::new(2, 40)).unwrap();
        assert_eq!(logger.last_written_lsn(), Lsn::new(2, 39));
        logger.append(PayloadType::Insert, vec![]).unwrap();
        logger.shutdown();
        logger.wait_for_shutdown().unwrap();
        assert_eq!(logger.rotate().unwrap(), Lsn::new(2, 40));
    }

    #[test]
    fn new_view_restarts_sequence() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let logger = DiskLogger::start(&config, Lsn::FIRST).unwrap();
        logger.append(PayloadType::Insert, vec![]).unwrap();

        assert!(logger.new_view(1).is_err());
        assert_eq!(logger.new_view(2).unwrap(), Lsn::new(2, 1));
        assert_eq!(
            logger.append(PayloadType::Insert, vec![]).unwrap(),
            Lsn::new(2, 1)
        );
        assert!(config.log_dir.join("2.1.log").exists());
    }
}
