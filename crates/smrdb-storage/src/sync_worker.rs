//! Background range-sync workers
//!
//! Writers that do not need to wait for durability hand their freshly written
//! byte ranges to a worker thread, which issues `sync_file_range` in FIFO
//! order. There is one queue for foreground file data and one for compaction
//! output so a large compaction flush never delays foreground writers.

use crate::raw_io::{RawFile, SyncFlags};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use smrdb_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

/// Which worker handles a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncQueue {
    Regular,
    Compaction,
}

/// One range to flush
///
/// The worker holds its own handle to the file, so the writer may close its
/// copy right after enqueueing.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub file: Arc<RawFile>,
    pub offset: u64,
    pub len: u64,
    pub flags: SyncFlags,
}

enum Message {
    Sync(SyncRequest),
    Barrier(Sender<()>),
}

/// Counters shared with a worker thread
#[derive(Debug, Default)]
pub struct SyncStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

struct Worker {
    name: &'static str,
    tx: Mutex<Option<Sender<Message>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    stats: Arc<SyncStats>,
}

impl Worker {
    fn start(name: &'static str) -> Result<Self> {
        let (tx, rx) = unbounded();
        let stats = Arc::new(SyncStats::default());
        let thread_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(name, &rx, &thread_stats))
            .map_err(|e| Error::internal(format!("failed to spawn {name}: {e}")))?;
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            stats,
        })
    }

    fn send(&self, msg: Message) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::internal(format!("{} is shut down", self.name)));
        };
        tx.send(msg)
            .map_err(|_| Error::internal(format!("{} exited", self.name)))
    }

    fn stop(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            error!("{} panicked", self.name);
        }
    }
}

fn run(name: &str, rx: &Receiver<Message>, stats: &SyncStats) {
    info!("{name} started");
    for msg in rx {
        match msg {
            Message::Sync(req) => match req.file.sync_range(req.offset, req.len, req.flags) {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    debug!("{name}: synced {}+{} on {}", req.offset, req.len, req.file.path());
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("{name}: sync of {}+{} failed: {e}", req.offset, req.len);
                }
            },
            Message::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    info!("{name} stopped");
}

/// The two sync worker threads
pub struct SyncWorkers {
    regular: Worker,
    compaction: Worker,
}

impl SyncWorkers {
    /// Spawn both workers
    pub fn start() -> Result<Self> {
        Ok(Self {
            regular: Worker::start("smr-sync")?,
            compaction: Worker::start("smr-compaction-sync")?,
        })
    }

    const fn worker(&self, queue: SyncQueue) -> &Worker {
        match queue {
            SyncQueue::Regular => &self.regular,
            SyncQueue::Compaction => &self.compaction,
        }
    }

    /// Queue a range without waiting
    pub fn submit(&self, queue: SyncQueue, request: SyncRequest) -> Result<()> {
        self.worker(queue).send(Message::Sync(request))
    }

    /// Wait until everything queued so far on `queue` has been processed
    pub fn flush(&self, queue: SyncQueue) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = self.worker(queue);
        worker.send(Message::Barrier(tx))?;
        rx.recv()
            .map_err(|_| Error::internal(format!("{} exited before the barrier", worker.name)))
    }

    #[must_use]
    pub fn stats(&self, queue: SyncQueue) -> &SyncStats {
        &self.worker(queue).stats
    }

    /// Drain and join both workers
    pub fn shutdown(&self) {
        self.regular.stop();
        self.compaction.stop();
    }
}

impl Drop for SyncWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
