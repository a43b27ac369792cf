//! Dependency-aware task scheduler.
//!
//! The Scheduler owns every task of a workflow. It promotes pending tasks
//! whose dependency types have resolved, asks the per-type parameter
//! strategy for their parameters, drains the Ready queue into a bounded
//! [`WorkerPool`] in `(priority, submission)` order, and files each
//! completed task's findings into the [`SharedContext`].
//!
//! All status transitions and promotions happen under the board lock, so
//! two dependents can never race into a duplicate promotion.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::{
    DependencyResolver, Finding, ProgressMap, Readiness, SharedContext, SkipReason, Target, Task,
    TaskId, TaskStatus, TaskType, Wave,
};
use crate::error::{Error, Result};
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::orchestration::runner::{TaskError, TaskOutput, TaskRunner};
use crate::storage::StateStore;
use crate::strategy::{strategy_for, StrategyOutcome};
use crate::stream::{EventPublisher, EventType};
use crate::workflow::WorkflowId;
use crate::{rlog, rlog_debug, rlog_warn};

/// Result of one [`Scheduler::start`] run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Static waves over the submitted task types.
    pub waves: Vec<Wave>,
    /// Task types in the order they left the Ready queue.
    pub drain_order: Vec<TaskType>,
    /// Task ids in the same order.
    pub dispatched: Vec<TaskId>,
    /// Tasks per status label across the whole board.
    pub counts: BTreeMap<String, usize>,
}

impl RunSummary {
    /// Tasks with the given status label, e.g. `"completed"`.
    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }
}

/// Ready-queue entry: lower priority value first, then earlier submission.
type ReadyKey = Reverse<(u8, u64, TaskId)>;

/// Tasks and the Ready queue, guarded by one lock.
#[derive(Default)]
struct Board {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    ready: BinaryHeap<ReadyKey>,
    next_seq: u64,
}

impl Board {
    fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.tasks[i]),
            None => Err(Error::TaskNotFound(*id)),
        }
    }

    fn insert(&mut self, task: Task) {
        self.index.insert(task.id, self.tasks.len());
        self.tasks.push(task);
    }

    /// Per-type progress in submission order.
    fn progress(&self) -> ProgressMap {
        let mut progress = ProgressMap::new();
        for task in &self.tasks {
            let entry = progress.entry(task.task_type).or_default();
            entry.total += 1;
            match &task.status {
                TaskStatus::Completed => entry.completed += 1,
                status if !status.is_terminal() => entry.non_terminal += 1,
                status => {
                    if entry.first_unsuccessful.is_none() {
                        entry.first_unsuccessful = Some(root_cause(task, status));
                    }
                }
            }
        }
        progress
    }

    fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in &self.tasks {
            *counts.entry(task.status.label().to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }
}

/// The task whose failure a dependent should blame.
fn root_cause(task: &Task, status: &TaskStatus) -> (TaskId, TaskType) {
    match status {
        TaskStatus::Skipped {
            reason: SkipReason::DependencyFailed { task_id, task_type },
        } => (*task_id, *task_type),
        _ => (task.id, task.task_type),
    }
}

/// Side effects collected under the board lock and flushed after it.
#[derive(Default)]
struct Effects {
    events: Vec<(EventType, Value)>,
    records: Vec<Task>,
    findings: Vec<Finding>,
}

impl Effects {
    fn transitioned(&mut self, task: &Task, event_type: EventType, extra: Value) {
        let mut payload = json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "status": task.status,
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, extra) {
            base.extend(extra);
        }
        self.events.push((event_type, payload));
        self.records.push(task.clone());
    }
}

/// Cloneable handle for observing and cancelling a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    board: Arc<Mutex<Board>>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Cancel the workflow: pending and ready tasks are cancelled without
    /// running, running tasks see their token fire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the workflow's token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy of every task in submission order.
    pub async fn snapshot(&self) -> Vec<Task> {
        self.board.lock().await.tasks.clone()
    }

    /// Copy of one task.
    ///
    /// # Arguments
    ///
    /// * `id` - Id returned by [`Scheduler::submit`]
    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.board.lock().await.get(&id).cloned()
    }

    /// Tasks per status label.
    pub async fn counts(&self) -> BTreeMap<String, usize> {
        self.board.lock().await.counts()
    }
}

/// Priority + dependency queue over a bounded worker pool.
pub struct Scheduler {
    workflow_id: WorkflowId,
    target: Target,
    resolver: Arc<DependencyResolver>,
    context: SharedContext,
    runner: Arc<dyn TaskRunner>,
    config: SchedulerConfig,
    board: Arc<Mutex<Board>>,
    cancel: CancellationToken,
    publisher: Option<Arc<EventPublisher>>,
    store: Option<Arc<dyn StateStore>>,
    persistence_failures: AtomicU64,
}

impl Scheduler {
    /// Create a scheduler over the full dependency graph.
    ///
    /// # Arguments
    ///
    /// * `workflow_id` - Workflow the tasks belong to; tags events and rows
    /// * `target` - Target the parameter strategies build from
    /// * `context` - Board that completed tasks file their findings into
    /// * `runner` - Executes each task
    /// * `config` - Concurrency limit, timeouts and priority overrides
    pub fn new(
        workflow_id: WorkflowId,
        target: Target,
        context: SharedContext,
        runner: Arc<dyn TaskRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            workflow_id,
            target,
            resolver: Arc::new(DependencyResolver::new()),
            context,
            runner,
            config,
            board: Arc::new(Mutex::new(Board::default())),
            cancel: CancellationToken::new(),
            publisher: None,
            store: None,
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Restrict scheduling to `resolver`'s graph.
    ///
    /// # Arguments
    ///
    /// * `resolver` - Dependency graph shared with the caller's plan
    pub fn with_resolver(mut self, resolver: Arc<DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Share a cancellation token with the caller.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Firing it cancels pending tasks and signals running ones
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish task lifecycle events.
    ///
    /// # Arguments
    ///
    /// * `publisher` - Publisher bound to the same workflow
    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Record every task transition.
    ///
    /// # Arguments
    ///
    /// * `store` - Task table; write failures are counted, not fatal
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handle for observing or cancelling from another task.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            board: self.board.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Fire the workflow's cancellation token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The board completed tasks file findings into.
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Task-table writes that failed.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Add a pending task of `task_type`.
    ///
    /// Parameters supplied here are used as-is; otherwise the type's
    /// strategy builds them when the task becomes ready. A task submitted
    /// after cancellation is cancelled immediately.
    ///
    /// # Arguments
    ///
    /// * `task_type` - Type to run; it depends on every task of its
    ///   dependency types
    /// * `params` - Parameters that bypass the type's strategy
    ///
    /// # Returns
    ///
    /// The id of the new task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `task_type` is outside the
    /// dependency graph or `params` is not a JSON object.
    pub async fn submit(&self, task_type: TaskType, params: Option<Value>) -> Result<TaskId> {
        if !self.resolver.contains(task_type) {
            return Err(Error::Validation(format!(
                "task type {} is not part of the dependency graph",
                task_type
            )));
        }
        if params.as_ref().is_some_and(|p| !p.is_object()) {
            return Err(Error::Validation(format!(
                "parameters for {} must be a JSON object",
                task_type
            )));
        }

        let mut effects = Effects::default();
        let id = {
            let mut board = self.board.lock().await;
            board.next_seq += 1;
            let mut task = Task::new(task_type, board.next_seq)
                .with_priority(self.config.priority_for(task_type))
                .with_depends_on(self.resolver.depends_on(task_type));
            if let Some(params) = params {
                task = task
                    .with_params(params)
                    .with_reasoning("parameters supplied at submit");
            }
            effects.transitioned(
                &task,
                EventType::TaskSubmitted,
                json!({ "priority": task.priority, "depends_on": task.depends_on }),
            );
            if self.cancel.is_cancelled() {
                task.transition(TaskStatus::Cancelled)?;
                effects.transitioned(&task, EventType::TaskCancelled, json!({}));
            }
            let id = task.id;
            board.insert(task);
            id
        };
        rlog_debug!("[{}] submitted {} ({})", self.workflow_id.short(), task_type, id.short());
        self.flush(effects).await;
        Ok(id)
    }

    /// Run until no task can make further progress.
    ///
    /// This drives execution. It:
    /// 1. Promotes pending tasks whose dependency types have resolved
    /// 2. Dispatches Ready tasks into the worker pool in priority order
    /// 3. Files findings and updates task status as workers finish
    /// 4. Skips tasks that can no longer become ready once nothing runs
    ///
    /// Returns once every submitted task is terminal. Can be called again
    /// after more tasks are submitted.
    ///
    /// # Returns
    ///
    /// The waves, drain order and status counts of this run.
    ///
    /// # Errors
    ///
    /// Returns an error if the submitted types cannot be layered into waves
    /// or the task board is left inconsistent.
    pub async fn start(&self) -> Result<RunSummary> {
        let waves = {
            let board = self.board.lock().await;
            let types: BTreeSet<TaskType> = board.tasks.iter().map(|t| t.task_type).collect();
            self.resolver.waves_for(&types)?
        };

        let (event_tx, mut event_rx) = mpsc::channel(std::cmp::max(64, self.config.max_concurrent * 2));
        let mut pool = WorkerPool::new(self.config.max_concurrent, event_tx);
        let mut drain_order = Vec::new();
        let mut dispatched = Vec::new();
        let mut cancel_handled = false;

        loop {
            if self.cancel.is_cancelled() && !cancel_handled {
                self.cancel_waiting().await?;
                cancel_handled = true;
            }
            if !cancel_handled {
                self.promote().await?;
                for (id, task_type) in self.dispatch(&mut pool).await? {
                    drain_order.push(task_type);
                    dispatched.push(id);
                }
            }

            if pool.active_count() == 0 {
                if cancel_handled || !self.resolve_stalled().await? {
                    break;
                }
                continue;
            }

            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(WorkerEvent::Finished { worker_id, task_id, result, elapsed }) => {
                        pool.release(worker_id)?;
                        rlog_debug!(
                            "[{}] task {} finished in {:?}",
                            self.workflow_id.short(),
                            task_id.short(),
                            elapsed
                        );
                        self.finish(task_id, result).await?;
                    }
                    Some(WorkerEvent::Started { .. }) => {}
                    None => break,
                },
                _ = self.cancel.cancelled(), if !cancel_handled => {}
            }
        }

        let counts = self.board.lock().await.counts();
        rlog!(
            "[{}] scheduler run finished: {} dispatched, {:?}",
            self.workflow_id.short(),
            dispatched.len(),
            counts
        );
        Ok(RunSummary {
            waves,
            drain_order,
            dispatched,
            counts,
        })
    }

    /// Re-evaluate every pending task, in submission order.
    async fn promote(&self) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut board = self.board.lock().await;
            // Promotions and skips change progress, so iterate until stable.
            loop {
                let progress = board.progress();
                let mut changed = false;
                for i in 0..board.tasks.len() {
                    if board.tasks[i].status != TaskStatus::Pending {
                        continue;
                    }
                    match self.resolver.readiness(&board.tasks[i].depends_on, &progress) {
                        Readiness::Blocked => {}
                        Readiness::Skip { reason } => {
                            let task = &mut board.tasks[i];
                            task.transition(TaskStatus::Skipped { reason })?;
                            effects.transitioned(task, EventType::TaskSkipped, json!({}));
                            changed = true;
                        }
                        Readiness::Ready => {
                            self.make_ready(&mut board, i, &mut effects)?;
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
        }
        self.flush(effects).await;
        Ok(())
    }

    /// Build parameters and queue the task, or skip it for lack of input.
    fn make_ready(&self, board: &mut Board, index: usize, effects: &mut Effects) -> Result<()> {
        let task = &mut board.tasks[index];
        if task.params.is_none() {
            match strategy_for(task.task_type).build(&self.context, &self.target) {
                StrategyOutcome::Skip { reasoning } => {
                    rlog_debug!("[{}] {} skipped: {}", self.workflow_id.short(), task.task_type, reasoning);
                    task.reasoning = Some(reasoning.clone());
                    task.transition(TaskStatus::Skipped {
                        reason: SkipReason::NoInput { reasoning },
                    })?;
                    effects.transitioned(task, EventType::TaskSkipped, json!({}));
                    return Ok(());
                }
                StrategyOutcome::Run(plan) => {
                    task.params = Some(plan.params);
                    task.reasoning = Some(plan.reasoning);
                    if let Some(priority) = plan.priority {
                        task.priority = priority;
                    }
                }
            }
        }
        task.transition(TaskStatus::Ready)?;
        effects.transitioned(
            task,
            EventType::TaskReady,
            json!({ "priority": task.priority, "reasoning": task.reasoning, "params": task.params }),
        );
        let key = Reverse((task.priority, task.seq, task.id));
        board.ready.push(key);
        Ok(())
    }

    /// Hand Ready tasks to free workers.
    async fn dispatch(&self, pool: &mut WorkerPool) -> Result<Vec<(TaskId, TaskType)>> {
        let mut effects = Effects::default();
        let mut started = Vec::new();
        {
            let mut board = self.board.lock().await;
            while pool.has_capacity() {
                let Some(Reverse((_, _, id))) = board.ready.pop() else {
                    break;
                };
                let task = board.get_mut(&id)?;
                if task.status != TaskStatus::Ready {
                    continue;
                }
                task.transition(TaskStatus::Assigned)?;
                let params = task.params.clone().unwrap_or(Value::Null);
                let timeout = self.config.timeout_for(task.task_type);
                pool.spawn(
                    id,
                    task.task_type,
                    params,
                    self.runner.clone(),
                    self.cancel.child_token(),
                    timeout,
                )?;
                task.transition(TaskStatus::Running)?;
                effects.transitioned(
                    task,
                    EventType::TaskStarted,
                    json!({ "timeout_ms": timeout.as_millis() as u64 }),
                );
                started.push((id, task.task_type));
            }
        }
        self.flush(effects).await;
        Ok(started)
    }

    /// Apply a worker's result to its task.
    async fn finish(
        &self,
        task_id: TaskId,
        result: std::result::Result<TaskOutput, TaskError>,
    ) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut board = self.board.lock().await;
            let task = board.get_mut(&task_id)?;
            match result {
                Ok(output) => {
                    let (written, new, dropped) =
                        self.file_findings(task, output.findings, &mut effects);
                    task.complete(output.result)?;
                    effects.transitioned(
                        task,
                        EventType::TaskCompleted,
                        json!({ "findings": written, "new_findings": new, "dropped_findings": dropped }),
                    );
                }
                Err(TaskError::Execution(error)) => {
                    rlog_warn!("[{}] {} failed: {}", self.workflow_id.short(), task.task_type, error);
                    task.transition(TaskStatus::Failed { error })?;
                    effects.transitioned(task, EventType::TaskFailed, json!({}));
                }
                Err(TaskError::TimedOut(after)) => {
                    rlog_warn!("[{}] {} timed out after {:?}", self.workflow_id.short(), task.task_type, after);
                    task.transition(TaskStatus::TimedOut {
                        timeout_ms: after.as_millis() as u64,
                    })?;
                    effects.transitioned(task, EventType::TaskTimedOut, json!({}));
                }
                Err(TaskError::Cancelled) => {
                    rlog_debug!("[{}] {} cancelled", self.workflow_id.short(), task.task_type);
                    task.transition(TaskStatus::Cancelled)?;
                    effects.transitioned(task, EventType::TaskCancelled, json!({}));
                }
            }
        }
        self.flush(effects).await;
        Ok(())
    }

    /// Write findings through the task type's producer mapping.
    ///
    /// The in-memory write happens here; mirroring waits for
    /// [`Scheduler::flush`]. Returns (written, new keys, dropped).
    fn file_findings(
        &self,
        task: &Task,
        findings: Vec<crate::core::FindingDraft>,
        effects: &mut Effects,
    ) -> (usize, usize, usize) {
        let allowed = task.task_type.produces();
        let (mut written, mut new, mut dropped) = (0, 0, 0);
        for draft in findings {
            if !allowed.contains(&draft.category) {
                rlog_warn!(
                    "[{}] {} returned a {} finding it does not produce; dropped",
                    self.workflow_id.short(),
                    task.task_type,
                    draft.category
                );
                dropped += 1;
                continue;
            }
            written += 1;
            let finding = Finding::from_draft(draft, task.id);
            if self.context.put_unmirrored(&finding) {
                new += 1;
            }
            effects.findings.push(finding);
        }
        (written, new, dropped)
    }

    /// Cancel everything that has not started.
    async fn cancel_waiting(&self) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut board = self.board.lock().await;
            board.ready.clear();
            for task in board.tasks.iter_mut() {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                    task.transition(TaskStatus::Cancelled)?;
                    effects.transitioned(task, EventType::TaskCancelled, json!({}));
                }
            }
        }
        rlog_debug!(
            "[{}] cancellation: {} waiting tasks cancelled",
            self.workflow_id.short(),
            effects.records.len()
        );
        self.flush(effects).await;
        Ok(())
    }

    /// With nothing running, skip pending tasks that can never become ready.
    ///
    /// Returns whether any task changed, in which case the loop continues.
    async fn resolve_stalled(&self) -> Result<bool> {
        let mut effects = Effects::default();
        {
            let mut board = self.board.lock().await;
            if !board.has_pending() {
                return Ok(false);
            }
            let progress = board.progress();
            // Prefer a task with a dependency type that was never
            // submitted; anything else left pending is stuck behind it.
            let index = board
                .tasks
                .iter()
                .position(|t| {
                    t.status == TaskStatus::Pending
                        && self
                            .resolver
                            .missing_dependency(&t.depends_on, &progress)
                            .is_some()
                })
                .or_else(|| board.tasks.iter().position(|t| t.status == TaskStatus::Pending));
            if let Some(index) = index {
                let task = &mut board.tasks[index];
                let blamed = self
                    .resolver
                    .missing_dependency(&task.depends_on, &progress)
                    .or_else(|| task.depends_on.iter().next().copied())
                    .unwrap_or(task.task_type);
                task.transition(TaskStatus::Skipped {
                    reason: SkipReason::DependencyUnavailable { task_type: blamed },
                })?;
                effects.transitioned(task, EventType::TaskSkipped, json!({}));
            }
        }
        let changed = !effects.records.is_empty();
        self.flush(effects).await;
        Ok(changed)
    }

    /// Mirror findings, publish events and record tasks, outside the
    /// board lock.
    async fn flush(&self, effects: Effects) {
        self.context.mirror_findings(effects.findings).await;
        if let Some(publisher) = &self.publisher {
            for (event_type, payload) in effects.events {
                publisher.publish(event_type, payload).await;
            }
        }
        if let Some(store) = &self.store {
            for task in &effects.records {
                if let Err(e) = store.record_task(self.workflow_id, task).await {
                    rlog_warn!("[{}] failed to record task {}: {}", self.workflow_id.short(), task.id.short(), e);
                    self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
