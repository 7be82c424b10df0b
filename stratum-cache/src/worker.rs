//! Bounded worker pool for background backfill and write-back tasks.
//!
//! Tasks go through a bounded channel drained by a fixed number of workers.
//! Submission never blocks: a full queue hands the task back to the caller,
//! who decides whether to run it inline or drop it.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Task = BoxFuture<'static, ()>;

/// Why a task was not queued. The task is handed back.
pub enum SubmitError {
    Full(Task),
    Closed(Task),
}

impl SubmitError {
    pub fn into_task(self) -> Task {
        match self {
            Self::Full(task) | Self::Closed(task) => task,
        }
    }
}

impl std::fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("SubmitError::Full"),
            Self::Closed(_) => f.write_str("SubmitError::Closed"),
        }
    }
}

#[derive(Debug, Default)]
struct PoolMetrics {
    queued: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub queue_depth: usize,
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current Tokio runtime.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<Task>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let metrics = Arc::new(PoolMetrics::default());

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else { break };
                        metrics.queued.fetch_sub(1, Ordering::Relaxed);
                        task.await;
                        metrics.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::trace!(worker = id, "Worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            handles: tokio::sync::Mutex::new(handles),
            metrics,
            capacity,
        }
    }

    pub fn try_submit(&self, task: Task) -> Result<(), SubmitError> {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(SubmitError::Closed(task)),
        };
        let Some(tx) = guard.as_ref() else {
            return Err(SubmitError::Closed(task));
        };

        // count before sending so a fast worker never drives the gauge below zero
        self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(task) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.queued.fetch_sub(1, Ordering::Relaxed);
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    mpsc::error::TrySendError::Full(task) => SubmitError::Full(task),
                    mpsc::error::TrySendError::Closed(task) => SubmitError::Closed(task),
                })
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.metrics.queued.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            queue_depth: self.queue_depth(),
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Stop accepting tasks and wait until every queued task has run.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        drop(sender);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        let snapshot = self.snapshot();
        tracing::debug!(
            completed = snapshot.completed,
            rejected = snapshot.rejected,
            "Worker pool drained"
        );
    }
}
