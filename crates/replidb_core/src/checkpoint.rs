//! Checkpoint files and the checkpoint coordinator.
//!
//! A checkpoint writes one file per database holding its CheckpointMark and
//! a frozen image of its indices, then deletes the log segments the mark
//! makes redundant.
//!
//! ## Consistency
//!
//! The coordinator pauses the [`ApplyGate`], so every assigned LSN has been
//! applied, then rotates the log. The LSN returned by the rotation is the
//! last entry durably on disk and becomes the mark of every database. The
//! indices are frozen before the gate reopens; files are written afterwards
//! while mutations continue.
//!
//! ## File Format
//!
//! ```text
//! | magic "RCKP" (4) | version (2) | db_id (4) | view (4) | seq (8) |
//! | image_len (8) | index image | crc32 (4) |
//! ```

use crate::catalog::Catalog;
use crate::dir::{write_atomic, EngineDir};
use crate::error::{CoreError, CoreResult};
use crate::gate::ApplyGate;
use crate::types::{DatabaseId, Lsn};
use crate::wal::{delete_segments_through, DiskLogger, PayloadReader};
use replidb_storage::IndexImage;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Magic bytes of a checkpoint file.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"RCKP";

/// Current checkpoint file version.
pub const CHECKPOINT_VERSION: u16 = 1;

/// How often the coordinator thread checks its triggers.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One database's persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    /// Database the checkpoint belongs to.
    pub database: DatabaseId,
    /// Every entry up to and including this LSN is reflected in `image`.
    pub mark: Lsn,
    /// Index contents at `mark`.
    pub image: IndexImage,
}

impl CheckpointFile {
    /// Encodes the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be encoded.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let image = self.image.encode()?;
        let mut buf = Vec::with_capacity(image.len() + 34);
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.database.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.mark.view_id().to_le_bytes());
        buf.extend_from_slice(&self.mark.sequence_no().to_le_bytes());
        buf.extend_from_slice(&(image.len() as u64).to_le_bytes());
        buf.extend_from_slice(&image);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad magic, newer version, checksum
    /// mismatch or truncation.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < CHECKPOINT_MAGIC.len() + 4 || data[0..4] != CHECKPOINT_MAGIC {
            return Err(CoreError::invalid_format("invalid checkpoint magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
            return Err(CoreError::invalid_format("checkpoint checksum mismatch"));
        }

        let parse = || -> CoreResult<Self> {
            let mut reader = PayloadReader::new(&body[4..]);
            let version = reader.u16()?;
            if version > CHECKPOINT_VERSION {
                return Err(CoreError::invalid_format(format!(
                    "unsupported checkpoint version: {version}"
                )));
            }
            let database = DatabaseId::new(reader.u32()?);
            let mark = reader.lsn()?;
            let image_len = reader.u64()? as usize;
            let image = IndexImage::decode(reader.bytes(image_len)?)?;
            reader.finish("checkpoint")?;
            Ok(Self {
                database,
                mark,
                image,
            })
        };
        parse().map_err(|e| match e {
            CoreError::MalformedPayload { message } => CoreError::invalid_format(message),
            other => other,
        })
    }
}

/// Writes a checkpoint file atomically.
pub(crate) fn write_checkpoint(dir: &EngineDir, checkpoint: &CheckpointFile) -> CoreResult<()> {
    write_atomic(&dir.checkpoint_path(checkpoint.database), &checkpoint.encode()?)?;
    Ok(())
}

/// Reads a database's checkpoint, or `None` if it has none.
pub(crate) fn read_checkpoint(dir: &EngineDir, id: DatabaseId) -> CoreResult<Option<CheckpointFile>> {
    match fs::read(dir.checkpoint_path(id)) {
        Ok(data) => {
            let checkpoint = CheckpointFile::decode(&data)?;
            if checkpoint.database != id {
                return Err(CoreError::invalid_format(format!(
                    "checkpoint for {id} belongs to {}",
                    checkpoint.database
                )));
            }
            Ok(Some(checkpoint))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Outcome of a completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Mark recorded for every database.
    pub mark: Lsn,
    /// Number of databases checkpointed.
    pub databases: usize,
    /// Number of log segments deleted.
    pub deleted_segments: usize,
}

/// Everything a checkpoint touches.
pub(crate) struct CheckpointContext {
    dir: Arc<EngineDir>,
    catalog: Arc<Catalog>,
    gate: Arc<ApplyGate>,
    logger: Arc<DiskLogger>,
    /// Held for the duration of one checkpoint.
    running: Mutex<()>,
    closed: AtomicBool,
}

impl CheckpointContext {
    pub(crate) fn new(
        dir: Arc<EngineDir>,
        catalog: Arc<Catalog>,
        gate: Arc<ApplyGate>,
        logger: Arc<DiskLogger>,
    ) -> Self {
        Self {
            dir,
            catalog,
            gate,
            logger,
            running: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true while a checkpoint is in flight.
    pub(crate) fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    /// Waits for an in-flight checkpoint and refuses any later one.
    pub(crate) fn close(&self) {
        let _running = self.running.lock();
        self.closed.store(true, Ordering::Release);
    }

    /// Runs one checkpoint. Returns `None` if another one is already running.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once the context is closed.
    pub(crate) fn run(&self) -> CoreResult<Option<CheckpointReport>> {
        let Some(_running) = self.running.try_lock() else {
            debug!("checkpoint already in progress");
            return Ok(None);
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        let started = Instant::now();

        // Database metadata must not change between freeze and write
        let _lock = self.catalog.modification_lock();
        let (mark, images) = {
            let _pause = self.gate.pause();
            let mark = self.logger.rotate()?;
            let images: Vec<_> = self
                .catalog
                .open_databases()
                .into_iter()
                .map(|db| (db.id(), db.store().freeze()))
                .collect();
            (mark, images)
        };
        debug!(mark = %mark, databases = images.len(), "checkpoint started");

        let databases = images.len();
        for (database, image) in images {
            write_checkpoint(
                &self.dir,
                &CheckpointFile {
                    database,
                    mark,
                    image,
                },
            )?;
        }

        let active = self.logger.active_segment();
        let deleted = delete_segments_through(self.logger.dir(), mark, active.as_deref())?;

        info!(
            mark = %mark,
            databases,
            deleted_segments = deleted.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint complete"
        );
        Ok(Some(CheckpointReport {
            mark,
            databases,
            deleted_segments: deleted.len(),
        }))
    }
}

/// Background thread firing checkpoints on a timer or log-size trigger.
pub(crate) struct Checkpointer {
    context: Arc<CheckpointContext>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Starts the coordinator thread.
    ///
    /// A zero `interval` disables the timer; the size trigger fires once
    /// the log has grown past `max_log_size` since the last checkpoint.
    pub(crate) fn start(
        context: Arc<CheckpointContext>,
        interval: Duration,
        max_log_size: u64,
    ) -> CoreResult<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let thread_context = Arc::clone(&context);
        let poll = if interval.is_zero() {
            POLL_INTERVAL
        } else {
            interval.min(POLL_INTERVAL)
        };

        let handle = thread::Builder::new()
            .name("replidb-checkpoint".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    match stop_rx.recv_timeout(poll) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let due = !interval.is_zero() && last.elapsed() >= interval;
                    let oversized = thread_context.logger.log_size() > max_log_size;
                    if !due && !oversized {
                        continue;
                    }
                    if let Err(e) = thread_context.run() {
                        error!(error = %e, "checkpoint failed");
                    }
                    last = Instant::now();
                }
                debug!("checkpoint coordinator stopped");
            })
            .map_err(|e| CoreError::SpawnFailed {
                name: "checkpoint".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            context,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// The context checkpoints run in, for forced checkpoints on the
    /// caller's thread.
    pub(crate) fn context(&self) -> Arc<CheckpointContext> {
        Arc::clone(&self.context)
    }

    /// Stops the thread, then waits for any in-flight checkpoint, including
    /// one forced from another thread.
    pub(crate) fn stop(&mut self) -> CoreResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let joined = match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                CoreError::io_failure(ErrorKind::Other, "checkpoint thread panicked")
            }),
            None => Ok(()),
        };
        self.context.close();
        joined
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
