//! Shared merge/teardown work queue
//!
//! One unbounded channel feeds a fixed pool of tokio worker tasks. Merge
//! admission is bounded upstream by [`crate::admission`]; teardown work is
//! always accepted. A pending-task count lets callers wait for the queue to
//! drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::accumulator::BuildRequest;
use crate::cache::{FlowHandle, Ticket};

/// Unit of background work
#[derive(Debug)]
pub enum Task {
    /// Build the merged flow for a claimed key
    Merge {
        /// Captured chain
        request: BuildRequest,
        /// Cache claim for the key
        ticket: Ticket,
    },
    /// Tear down one merged flow
    Teardown(FlowHandle),
}

/// Sending side of the work queue
pub struct WorkQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl WorkQueue {
    /// Open queue and the receiver for [`spawn_workers`]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx: Mutex::new(Some(tx)),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        };
        (queue, rx)
    }

    /// Queue a task; hands it back if the queue is closed
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(task);
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(task).map_err(|e| {
            self.complete();
            e.0
        })
    }

    /// Mark one pushed task as finished
    pub fn complete(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every pushed task has completed
    pub async fn flush(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting tasks; workers exit once the backlog is drained
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// `close` has been called
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Spawn `count` workers running `exec` for each task
///
/// `exec` runs on the blocking pool, since it drives the synchronous
/// hardware installer. Must be called from within a tokio runtime.
pub fn spawn_workers<F>(
    count: usize,
    rx: mpsc::UnboundedReceiver<Task>,
    exec: Arc<F>,
) -> Vec<JoinHandle<()>>
where
    F: Fn(Task) + Send + Sync + 'static,
{
    let rx = Arc::new(AsyncMutex::new(rx));
    (0..count)
        .map(|id| {
            let rx = Arc::clone(&rx);
            let exec = Arc::clone(&exec);
            tokio::spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    let Some(task) = task else { break };
                    let exec = Arc::clone(&exec);
                    if let Err(e) = tokio::task::spawn_blocking(move || exec(task)).await {
                        tracing::warn!("miniflow worker {} task failed: {}", id, e);
                    }
                }
                tracing::debug!("miniflow worker {} stopped", id);
            })
        })
        .collect()
}
