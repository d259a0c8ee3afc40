//! Consumer callback dispatch.
//!
//! Callbacks either run inline on the reader task, or on a fixed pool of
//! workers with bounded queues. A conversation always maps to the same
//! worker, so its messages are delivered in order.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Where consumer callbacks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchMode {
    /// On the reader task; a slow callback stalls the connection
    #[default]
    Inline,
    /// On a worker pool; a full worker queue stalls the reader
    WorkerPool {
        /// Number of workers
        workers: usize,
        /// Jobs queued per worker
        queue_depth: usize,
    },
}

/// A unit of callback work
pub type Job = Box<dyn FnOnce() + Send>;

/// Runs callback jobs according to a [`DispatchMode`].
pub struct Dispatcher {
    workers: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    /// Build a dispatcher, spawning workers for the pool mode.
    ///
    /// Must be called inside a tokio runtime when `mode` is a worker pool.
    pub fn new(mode: DispatchMode) -> Self {
        let workers = match mode {
            DispatchMode::Inline => Vec::new(),
            DispatchMode::WorkerPool {
                workers,
                queue_depth,
            } => (0..workers.max(1))
                .map(|_| {
                    let (tx, mut rx) = mpsc::channel::<Job>(queue_depth.max(1));
                    tokio::spawn(async move {
                        while let Some(job) = rx.recv().await {
                            job();
                        }
                    });
                    tx
                })
                .collect(),
        };
        Self { workers }
    }

    /// Active mode
    pub fn is_inline(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run `job` for `conversation_id`, waiting for queue space in pool mode.
    pub async fn dispatch(&self, conversation_id: u32, job: Job) {
        if self.workers.is_empty() {
            job();
            return;
        }
        let worker = conversation_id as usize % self.workers.len();
        if self.workers[worker].send(job).await.is_err() {
            warn!(conversation_id, worker, "Dispatch worker stopped, dropping callback");
        }
    }
}
