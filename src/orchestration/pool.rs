//! Bounded pool of task workers.
//!
//! The `WorkerPool` enforces the concurrency limit, runs each task on its
//! own tokio task under a timeout and a child cancellation token, and
//! reports lifecycle changes as [`WorkerEvent`]s over a channel.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskId, TaskType};
use crate::error::{Error, Result};
use crate::orchestration::runner::{TaskError, TaskOutput, TaskRunner};
use crate::rlog_debug;

/// Identifier of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Events emitted by the pool.
///
/// Every spawned worker sends `Started` and then exactly one `Finished`,
/// so the consumer can free the slot without polling.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A worker invoked the runner.
    Started { worker_id: WorkerId, task_id: TaskId },
    /// A worker finished, successfully or not.
    Finished {
        worker_id: WorkerId,
        task_id: TaskId,
        result: std::result::Result<TaskOutput, TaskError>,
        elapsed: Duration,
    },
}

/// A worker currently holding a slot.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Slot identifier, unique within the pool.
    pub id: WorkerId,
    /// The task the worker is running.
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// When the worker was spawned.
    pub started: Instant,
    join: JoinHandle<()>,
}

/// Manages concurrent task executions.
///
/// The `WorkerPool` tracks every worker holding a slot, refuses spawns past
/// `max_concurrent`, and reports worker lifecycle changes on a channel.
/// A slot stays taken until [`WorkerPool::release`] is called for it.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::mpsc;
/// use reconflow::orchestration::WorkerPool;
///
/// let (tx, _rx) = mpsc::channel(100);
/// let pool = WorkerPool::new(3, tx);
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct WorkerPool {
    /// Workers holding a slot, by id.
    workers: HashMap<WorkerId, WorkerHandle>,
    max_concurrent: usize,
    next_id: u64,
    /// Channel for worker events.
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerPool {
    /// Create a pool with the given capacity.
    ///
    /// # Arguments
    ///
    /// * `max_concurrent` - Maximum number of workers running at once; 0 is
    ///   treated as 1
    /// * `event_tx` - Channel sender for [`WorkerEvent`]s
    pub fn new(max_concurrent: usize, event_tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            workers: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
            next_id: 0,
            event_tx,
        }
    }

    /// Run a task on a new worker.
    ///
    /// The worker stops waiting on the runner when `cancel` fires or the
    /// timeout expires, and always reports [`WorkerEvent::Finished`]. A
    /// timeout also fires `cancel` so the runner can stop its own work.
    ///
    /// # Arguments
    ///
    /// * `task_id` - The task the worker runs
    /// * `task_type` - Passed through to the runner
    /// * `params` - Resolved task parameters
    /// * `runner` - Executes the task
    /// * `cancel` - Token for this task; firing it ends the wait with
    ///   [`TaskError::Cancelled`]
    /// * `timeout` - Upper bound on the runner call
    ///
    /// # Returns
    ///
    /// The id of the worker slot now held by the task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPoolFull`] when every slot is taken.
    pub fn spawn(
        &mut self,
        task_id: TaskId,
        task_type: TaskType,
        params: Value,
        runner: Arc<dyn TaskRunner>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }

        self.next_id += 1;
        let worker_id = WorkerId(self.next_id);
        let event_tx = self.event_tx.clone();
        let started = Instant::now();

        let join = tokio::spawn(async move {
            let _ = event_tx
                .send(WorkerEvent::Started { worker_id, task_id })
                .await;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                outcome = tokio::time::timeout(timeout, runner.run(task_type, params, cancel.clone())) => {
                    match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            cancel.cancel();
                            Err(TaskError::TimedOut(timeout))
                        }
                    }
                }
            };

            let _ = event_tx
                .send(WorkerEvent::Finished {
                    worker_id,
                    task_id,
                    result,
                    elapsed: started.elapsed(),
                })
                .await;
        });

        rlog_debug!("worker {} took task {} ({})", worker_id, task_id.short(), task_type);
        self.workers.insert(
            worker_id,
            WorkerHandle {
                id: worker_id,
                task_id,
                task_type,
                started,
                join,
            },
        );
        Ok(worker_id)
    }

    /// Free a worker's slot after its `Finished` event was handled.
    ///
    /// # Arguments
    ///
    /// * `id` - The worker named in the `Finished` event
    ///
    /// # Returns
    ///
    /// The released worker's handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no worker with `id` holds a slot.
    pub fn release(&mut self, id: WorkerId) -> Result<WorkerHandle> {
        self.workers.remove(&id).ok_or_else(|| {
            Error::Validation(format!("worker {} is not in the pool", id))
        })
    }

    /// Abort every worker without waiting for its runner.
    ///
    /// Aborted workers send no `Finished` event. Also runs on drop.
    pub fn abort_all(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.join.abort();
        }
    }

    /// Look up a worker holding a slot.
    ///
    /// # Arguments
    ///
    /// * `id` - The worker to find
    pub fn get(&self, id: &WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    /// Number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether [`WorkerPool::spawn`] would accept another task.
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}
