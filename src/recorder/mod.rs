//! # Session Recorder
//!
//! Persists inbound and outbound messages of a live session so they can be
//! analysed offline or fed back through the replay engine.
//!
//! ```text
//! receive loop ─┐
//!               ├─► DropOldestQueue ──► writer thread ──► SQLite / JSON lines
//! publish() ────┘     (never blocks)      (batches)
//! ```
//!
//! The network side only ever pushes into a bounded queue. When the writer
//! falls behind the oldest queued message is dropped and counted; the
//! receive loop is never delayed by disk I/O.

pub mod queue;
pub mod store;

use statum::{machine, state};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::mqtt::message::EnvelopeMessage;
use queue::DropOldestQueue;
use store::{open_store, RecordStore};

const BATCH_SIZE: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(String),

    #[error("recorder is not running")]
    NotRunning,

    #[error("failed to spawn writer thread: {0}")]
    ThreadSpawn(String),
}

/// Counters surfaced to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStatus {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
    pub write_errors: u64,
    pub queue_len: usize,
    pub running: bool,
}

struct RecorderShared {
    queue: DropOldestQueue<Arc<EnvelopeMessage>>,
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    write_errors: AtomicU64,
    running: AtomicBool,
}

impl RecorderShared {
    fn new(capacity: usize) -> Self {
        Self {
            queue: DropOldestQueue::new(capacity),
            enqueued: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    fn status(&self) -> RecorderStatus {
        RecorderStatus {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum WriterState {
    Opening,
    Writing,
}

#[machine]
struct RecordWriter<S: WriterState> {
    store: Box<dyn RecordStore>,
    shared: Arc<RecorderShared>,
}

impl RecordWriter<Opening> {
    fn create(store: Box<dyn RecordStore>, shared: Arc<RecorderShared>) -> Self {
        debug!("Creating record writer for {}", store.path().display());
        Self::new(store, shared)
    }

    fn begin(self) -> RecordWriter<Writing> {
        info!("Record writer started: {}", self.store.path().display());
        self.transition()
    }
}

impl RecordWriter<Writing> {
    /// Drains the queue until it is closed, then flushes the store.
    fn run_until_closed(mut self) {
        while let Some(batch) = self.shared.queue.pop_batch(BATCH_SIZE, POLL_INTERVAL) {
            if batch.is_empty() {
                continue;
            }
            match self.store.append(&batch) {
                Ok(n) => {
                    self.shared.written.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("Failed to write {} recorded messages: {}", batch.len(), e);
                    self.shared
                        .write_errors
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
            }
        }

        if let Err(e) = self.store.flush() {
            error!("Failed to flush recording {}: {}", self.store.path().display(), e);
        }
        self.shared.running.store(false, Ordering::Relaxed);
        info!("Record writer stopped: {}", self.store.path().display());
    }
}

/// Handle to a running recording.
pub struct SessionRecorder {
    path: PathBuf,
    shared: Arc<RecorderShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SessionRecorder {
    /// Opens the store, creates the schema and starts the writer thread.
    pub fn start(path: &Path, config: &RecorderConfig) -> Result<Self, StorageError> {
        let store = open_store(path, config.max_rows, config.prune_every)?;
        let shared = Arc::new(RecorderShared::new(config.queue_capacity));

        let writer = RecordWriter::create(store, Arc::clone(&shared)).begin();
        let worker = std::thread::Builder::new()
            .name("session-recorder".to_string())
            .spawn(move || writer.run_until_closed())
            .map_err(|e| StorageError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a message for writing. Never blocks.
    pub fn record(&self, message: Arc<EnvelopeMessage>) {
        match self.shared.queue.push(message) {
            Some(dropped) => {
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                if dropped {
                    let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total.is_power_of_two() {
                        warn!("Recorder queue full, {} messages dropped so far", total);
                    }
                }
            }
            None => debug!("Recorder closed, message not recorded"),
        }
    }

    pub fn status(&self) -> RecorderStatus {
        self.shared.status()
    }

    /// Closes the queue, lets the writer drain it and waits for the flush.
    pub fn stop(&self) -> RecorderStatus {
        self.shared.queue.close();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Recorder writer thread panicked");
            }
        }
        self.shared.running.store(false, Ordering::Relaxed);
        let status = self.status();
        info!(
            "Recording {} stopped: {} written, {} dropped",
            self.path.display(),
            status.written,
            status.dropped
        );
        status
    }

    #[cfg(test)]
    fn detached(capacity: usize) -> Self {
        Self {
            path: PathBuf::from("detached"),
            shared: Arc::new(RecorderShared::new(capacity)),
            worker: Mutex::new(None),
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .map(|w| w.is_some())
            .unwrap_or(false);
        if running {
            self.stop();
        }
    }
}
