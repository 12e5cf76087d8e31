//! Single-worker task queue
//!
//! All work that touches nginx, the nginx config directory or acme.sh goes
//! through one [`TaskQueue`]. Exactly one task runs at a time, in FIFO order,
//! which is the only concurrency control those external resources get.
//!
//! Producers get an immediate accepted/rejected answer from
//! [`TaskQueue::add_job`] and never the task's outcome. Tasks report results
//! by writing the entity's status columns; callers poll the entity.

use crate::error::QueueError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of pending tasks before producers block
pub const DEFAULT_CAPACITY: usize = 10;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A named, deferred unit of work
pub struct Task {
    name: String,
    action: Action,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("action", &"<FnOnce>")
            .finish()
    }
}

struct Running {
    tx: mpsc::Sender<Task>,
    cancel_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Bounded FIFO queue drained by a single worker
pub struct TaskQueue {
    capacity: usize,
    state: Mutex<Option<Running>>,
}

impl TaskQueue {
    /// Create an unstarted queue; `capacity` of 0 is treated as 1
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Allocate the buffer and spawn the worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(QueueError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = tokio::spawn(worker_loop(rx, cancel_rx));

        *state = Some(Running { tx, cancel_tx, worker });
        info!(capacity = self.capacity, "Task queue started");
        Ok(())
    }

    /// Enqueue a task
    ///
    /// Waits for space when the buffer is full. Fails only when the queue is
    /// not running.
    pub async fn add_job(&self, task: Task) -> Result<(), QueueError> {
        let tx = self
            .state
            .lock()
            .as_ref()
            .map(|running| running.tx.clone())
            .ok_or(QueueError::NotStarted)?;

        debug!(task = %task.name, "Enqueueing task");
        tx.send(task).await.map_err(|rejected| {
            warn!(task = %rejected.0.name, "Task queue stopped before task could be enqueued");
            QueueError::NotStarted
        })
    }

    /// Signal the worker to stop and wait for it to exit
    ///
    /// A task already executing runs to completion. Tasks still buffered are
    /// dropped.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        let running = self.state.lock().take().ok_or(QueueError::NotStarted)?;

        info!("Shutting down task queue");
        let _ = running.cancel_tx.send(true);
        drop(running.tx);

        if let Err(e) = running.worker.await {
            error!(error = %e, "Task queue worker terminated abnormally");
        }

        info!("Task queue stopped");
        Ok(())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Task>, mut cancel_rx: watch::Receiver<bool>) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        execute(task).await;
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped, "Discarded pending tasks on shutdown");
    }
}

async fn execute(task: Task) {
    let Task { name, action } = task;
    let started = Instant::now();
    debug!(task = %name, "Running task");

    // Run on its own task so a panicking action does not take the worker down
    let result = tokio::spawn(async move { action().await }).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(())) => debug!(task = %name, elapsed_ms, "Task completed"),
        Ok(Err(e)) => error!(task = %name, elapsed_ms, error = %format!("{:#}", e), "Task failed"),
        Err(e) => error!(task = %name, elapsed_ms, error = %e, "Task panicked"),
    }
}
