//! Worker pool sequencing mutations per database.
//!
//! Each worker owns a bounded queue and a named thread. A database is always
//! routed to worker `id % workers`, so operations on one database run in
//! submission order. With zero workers, jobs run on the calling thread and
//! no queue or thread is created.

use crate::error::{CoreError, CoreResult};
use crate::types::DatabaseId;
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of a submitted operation.
#[derive(Debug)]
pub enum PendingResult<T> {
    /// Completed before `submit` returned.
    Ready(CoreResult<T>),
    /// Completes when the worker finishes the job.
    Waiting(Receiver<CoreResult<T>>),
}

impl<T> PendingResult<T> {
    /// Blocks until the operation completes.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or `ShuttingDown` if the pool was torn
    /// down before the job ran.
    pub fn wait(self) -> CoreResult<T> {
        match self {
            Self::Ready(result) => result,
            Self::Waiting(rx) => rx.recv().map_err(|_| CoreError::ShuttingDown)?,
        }
    }

    /// Returns true if the result is already available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Fixed set of sequencing threads.
pub struct WorkerPool {
    senders: RwLock<Option<Vec<SyncSender<Job>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `num_threads` workers with queues of `max_queue_length` jobs.
    ///
    /// # Errors
    ///
    /// Returns `SpawnFailed` if a thread cannot be created; workers already
    /// started are stopped again.
    pub fn start(num_threads: usize, max_queue_length: usize) -> CoreResult<Self> {
        let mut senders = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let (tx, rx) = mpsc::sync_channel::<Job>(max_queue_length.max(1));
            let spawned = thread::Builder::new()
                .name(format!("replidb-worker-{worker_id}"))
                .spawn(move || worker_main(worker_id, &rx));
            match spawned {
                Ok(handle) => {
                    senders.push(tx);
                    handles.push(handle);
                }
                Err(e) => {
                    drop(senders);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(CoreError::SpawnFailed {
                        name: format!("worker-{worker_id}"),
                        message: e.to_string(),
                    });
                }
            }
        }

        if num_threads > 0 {
            info!(workers = num_threads, queue = max_queue_length, "worker pool started");
        }
        Ok(Self {
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            size: num_threads,
        })
    }

    /// Number of worker threads (0 means inline execution).
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Worker a database is routed to, or `None` for inline execution.
    #[must_use]
    pub fn worker_for(&self, database: DatabaseId) -> Option<usize> {
        if self.size == 0 {
            None
        } else {
            Some(database.as_u32() as usize % self.size)
        }
    }

    /// Submits a job for `database`.
    ///
    /// Blocks while the worker's queue is full.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once [`WorkerPool::shutdown`] has started.
    pub fn submit<T, F>(&self, database: DatabaseId, job: F) -> CoreResult<PendingResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> CoreResult<T> + Send + 'static,
    {
        let sender = {
            let senders = self.senders.read();
            let senders = senders.as_ref().ok_or(CoreError::ShuttingDown)?;
            self.worker_for(database).map(|worker| senders[worker].clone())
        };
        let Some(sender) = sender else {
            return Ok(PendingResult::Ready(job()));
        };

        let (tx, rx) = mpsc::channel();
        let boxed: Job = Box::new(move || {
            // The caller may have stopped waiting
            let _ = tx.send(job());
        });
        sender.send(boxed).map_err(|_| CoreError::ShuttingDown)?;
        Ok(PendingResult::Waiting(rx))
    }

    /// Stops accepting jobs, lets every worker drain its queue and joins them.
    pub fn shutdown(&self) {
        let senders = self.senders.write().take();
        drop(senders);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.senders.read().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn worker_main(worker_id: usize, rx: &Receiver<Job>) {
    debug!(worker_id, "worker started");
    let mut processed = 0u64;
    while let Ok(job) = rx.recv() {
        job();
        processed += 1;
    }
    debug!(worker_id, processed, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn zero_workers_run_inline() {
        let pool = WorkerPool::start(0, 10).unwrap();
        let caller = thread::current().id();
        let pending = pool
            .submit(DatabaseId::new(3), move || Ok(thread::current().id() == caller))
            .unwrap();
        assert!(pending.is_ready());
        assert!(pending.wait().unwrap());
        assert_eq!(pool.worker_for(DatabaseId::new(3)), None);
    }

    #[test]
    fn routes_by_database_id() {
        let pool = WorkerPool::start(3, 4).unwrap();
        assert_eq!(pool.worker_for(DatabaseId::new(1)), Some(1));
        assert_eq!(pool.worker_for(DatabaseId::new(5)), Some(2));
        assert_eq!(pool.worker_for(DatabaseId::new(6)), Some(0));

        let name = pool
            .submit(DatabaseId::new(5), || {
                Ok(thread::current().name().map(str::to_string))
            })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(name.as_deref(), Some("replidb-worker-2"));
    }

    #[test]
    fn same_database_runs_in_submission_order() {
        let pool = WorkerPool::start(2, 64).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pending: Vec<_> = (0..50)
            .map(|i| {
                let seen = Arc::clone(&seen);
                pool.submit(DatabaseId::new(7), move || {
                    if i % 10 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                    seen.lock().push(i);
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for p in pending {
            p.wait().unwrap();
        }
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn errors_are_returned_to_the_caller() {
        let pool = WorkerPool::start(1, 4).unwrap();
        let err = pool
            .submit(DatabaseId::new(1), || -> CoreResult<()> {
                Err(CoreError::no_such_database("missing"))
            })
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSuchDatabase { .. }));

        // The worker survives a failed job
        assert_eq!(
            pool.submit(DatabaseId::new(1), || Ok(5)).unwrap().wait().unwrap(),
            5
        );
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let pool = WorkerPool::start(1, 16).unwrap();
        let pending: Vec<_> = (0..10)
            .map(|i| {
                pool.submit(DatabaseId::new(0), move || {
                    thread::sleep(Duration::from_millis(2));
                    Ok(i)
                })
                .unwrap()
            })
            .collect();
        pool.shutdown();

        let results: Vec<_> = pending.into_iter().map(|p| p.wait().unwrap()).collect();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert!(matches!(
            pool.submit(DatabaseId::new(0), || Ok(())),
            Err(CoreError::ShuttingDown)
        ));
    }
}
