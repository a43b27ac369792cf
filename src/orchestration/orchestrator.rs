//! Top-level workflow driver.
//!
//! Lifecycle of one workflow:
//! plan → execute → next-step decision rounds → triage/escalation →
//! aggregate → final report → terminal event.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Category, DependencyResolver, FindingMirror, SharedContext, Target, TaskType};
use crate::orchestration::aggregator::{AggregateReport, ResultAggregator};
use crate::orchestration::budget::Budget;
use crate::orchestration::router::{
    BudgetRouter, Decision, DecisionContext, DecisionKind, DecisionProvider, RoutedDecision,
};
use crate::orchestration::runner::TaskRunner;
use crate::orchestration::scheduler::{RunSummary, Scheduler};
use crate::storage::{Database, StateStore};
use crate::stream::{
    EventLog, EventPublisher, EventStream, EventType, MemoryEventLog, StatusBoard,
};
use crate::workflow::{WorkflowId, WorkflowStatus};
use crate::{rlog, rlog_error, rlog_warn, Result};

/// What to investigate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub target: String,
    /// Requested task types; their dependencies are added. Empty means all.
    #[serde(default)]
    pub task_types: BTreeSet<TaskType>,
    /// Parameters that bypass a type's strategy.
    #[serde(default)]
    pub params: BTreeMap<TaskType, Value>,
}

impl WorkflowRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_task_types(mut self, task_types: impl IntoIterator<Item = TaskType>) -> Self {
        self.task_types.extend(task_types);
        self
    }

    pub fn with_params(mut self, task_type: TaskType, params: Value) -> Self {
        self.params.insert(task_type, params);
        self
    }
}

/// Workflow-level conditions the caller must know about. None of them
/// aborts the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "warning")]
pub enum WorkflowWarning {
    /// Events could not be persisted; the stream is missing them.
    StreamGap { dropped: u64 },
    /// Findings could not be mirrored to storage.
    MirrorFailures { count: u64 },
    /// Task or workflow rows could not be written.
    PersistenceFailures { count: u64 },
}

/// Everything a finished workflow produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub report: AggregateReport,
    pub summary: String,
    pub decisions: Vec<RoutedDecision>,
    pub budget: Budget,
    pub runs: Vec<RunSummary>,
    pub warnings: Vec<WorkflowWarning>,
}

impl WorkflowOutcome {
    pub fn decisions_of(&self, kind: DecisionKind) -> impl Iterator<Item = &RoutedDecision> {
        self.decisions.iter().filter(move |d| d.kind == kind)
    }
}

/// Wires scheduler, router, aggregator and event stream into a workflow.
pub struct Orchestrator {
    config: Config,
    runner: Arc<dyn TaskRunner>,
    lightweight: Arc<dyn DecisionProvider>,
    deep: Arc<dyn DecisionProvider>,
    event_log: Arc<dyn EventLog>,
    store: Option<Arc<dyn StateStore>>,
    mirror: Option<Arc<dyn FindingMirror>>,
    statuses: Arc<StatusBoard>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        runner: Arc<dyn TaskRunner>,
        lightweight: Arc<dyn DecisionProvider>,
        deep: Arc<dyn DecisionProvider>,
    ) -> Self {
        Self {
            config,
            runner,
            lightweight,
            deep,
            event_log: Arc::new(MemoryEventLog::new()),
            store: None,
            mirror: None,
            statuses: Arc::new(StatusBoard::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    /// Persist events, tasks, findings and workflow rows to `db`.
    pub fn with_database(mut self, db: Database) -> Self {
        let db = Arc::new(db);
        self.event_log = db.clone();
        self.store = Some(db.clone());
        self.mirror = Some(db);
        self
    }

    /// Open the configured database, if any.
    pub fn with_configured_storage(self) -> Result<Self> {
        match self.config.storage.database_path() {
            Some(path) => Ok(self.with_database(Database::open(&path)?)),
            None => Ok(self),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn event_log(&self) -> Arc<dyn EventLog> {
        self.event_log.clone()
    }

    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowOutcome> {
        self.run_with_id(WorkflowId::new(), request).await
    }

    /// Run a workflow under a caller-chosen id, so a consumer can attach
    /// to its stream before it starts.
    ///
    /// An invalid target or plan is rejected before anything is published.
    /// Any later error ends the workflow as failed: `WorkflowFailed` is
    /// published and the status recorded before the error is returned.
    pub async fn run_with_id(
        &self,
        workflow_id: WorkflowId,
        request: WorkflowRequest,
    ) -> Result<WorkflowOutcome> {
        let target = Target::parse(&request.target)?;
        let resolver = Arc::new(DependencyResolver::new());
        let requested = if request.task_types.is_empty() {
            resolver.types()
        } else {
            request.task_types.clone()
        };
        let types = resolver.closure(&requested);
        let waves = resolver.waves_for(&types)?;

        let publisher = Arc::new(EventPublisher::with_config(
            workflow_id,
            self.event_log.clone(),
            &self.config.stream,
        ));
        let mut context = SharedContext::new();
        if let Some(mirror) = &self.mirror {
            context = context.with_mirror(mirror.clone());
        }
        let mut run = Run {
            workflow_id,
            target,
            resolver,
            types,
            publisher,
            context,
            persistence_failures: 0,
        };
        self.record_workflow(&mut run, WorkflowStatus::Running).await;

        rlog!("[{}] workflow started against {}", workflow_id.short(), run.target);
        run.publisher
            .publish(
                EventType::WorkflowStarted,
                json!({
                    "target": run.target.raw(),
                    "host": run.target.host(),
                    "task_types": run.types,
                }),
            )
            .await;
        run.publisher
            .publish(EventType::PlanComputed, json!({ "waves": waves }))
            .await;

        match self.execute(&mut run, &request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                rlog_error!("[{}] workflow failed: {}", workflow_id.short(), e);
                run.publisher
                    .publish(
                        EventType::WorkflowFailed,
                        json!({ "status": WorkflowStatus::Failed, "error": e.to_string() }),
                    )
                    .await;
                self.record_workflow(&mut run, WorkflowStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Stream a workflow's events after `after_sequence`, ending when the
    /// workflow ends even if its terminal event never reached the log.
    pub fn stream(&self, workflow_id: WorkflowId, after_sequence: u64) -> EventStream {
        EventStream::new(self.event_log.clone(), workflow_id, after_sequence)
            .with_config(&self.config.stream)
            .with_status_source(self.statuses.clone())
    }

    /// Statuses recorded by this orchestrator's workflows.
    pub fn status_source(&self) -> Arc<StatusBoard> {
        self.statuses.clone()
    }

    /// Schedule, decide, aggregate and report once the workflow is started.
    async fn execute(&self, run: &mut Run, request: &WorkflowRequest) -> Result<WorkflowOutcome> {
        let workflow_id = run.workflow_id;
        let publisher = run.publisher.clone();
        let context = run.context.clone();
        let resolver = run.resolver.clone();
        let mut planned = run.types.clone();

        let mut scheduler = Scheduler::new(
            workflow_id,
            run.target.clone(),
            context.clone(),
            self.runner.clone(),
            self.config.scheduler.clone(),
        )
        .with_resolver(resolver.clone())
        .with_cancel_token(self.cancel.clone())
        .with_publisher(publisher.clone());
        if let Some(store) = &self.store {
            scheduler = scheduler.with_store(store.clone());
        }
        let router = BudgetRouter::new(
            self.lightweight.clone(),
            self.deep.clone(),
            &self.config.budget,
        )
        .with_publisher(publisher.clone());
        let aggregator = ResultAggregator::default();

        for task_type in &run.types {
            scheduler
                .submit(*task_type, request.params.get(task_type).cloned())
                .await?;
        }
        let mut runs = vec![scheduler.start().await?];
        let mut decisions = Vec::new();

        for round in 1..=self.config.budget.max_decision_rounds {
            if self.cancel.is_cancelled() {
                break;
            }
            let report = aggregator.aggregate(&context);
            let decision_context = DecisionContext::new(
                DecisionKind::NextSteps,
                report.total_findings,
                format!("Round {}: {}. Which task types should run next?", round, report.summary()),
            )
            .with_data(report.to_value()?);
            let routed = self.route(&router, &publisher, decision_context).await;
            let next: Vec<TaskType> = match &routed.decision {
                Decision::RunTasks { task_types, .. } => {
                    let wanted: BTreeSet<TaskType> = task_types.iter().copied().collect();
                    // Requested types run again; unplanned dependencies run once.
                    resolver
                        .closure(&wanted)
                        .into_iter()
                        .filter(|t| wanted.contains(t) || !planned.contains(t))
                        .collect()
                }
                _ => Vec::new(),
            };
            decisions.push(routed);
            if next.is_empty() {
                break;
            }
            rlog!("[{}] decision round {} schedules {:?}", workflow_id.short(), round, next);
            for task_type in next {
                planned.insert(task_type);
                scheduler.submit(task_type, None).await?;
            }
            runs.push(scheduler.start().await?);
        }

        let report = aggregator.aggregate(&context);
        if report.count(Category::Vulnerability) > 0 {
            let (kind, prompt) = if report.severe_count() > 0 {
                (
                    DecisionKind::Escalation,
                    format!(
                        "{} high/critical vulnerabilities on {}. Escalate?",
                        report.severe_count(),
                        report.correlations.vulnerable_hosts.join(", ")
                    ),
                )
            } else {
                (
                    DecisionKind::Triage,
                    format!(
                        "{} lower-severity vulnerabilities. Triage them.",
                        report.count(Category::Vulnerability)
                    ),
                )
            };
            let decision_context =
                DecisionContext::new(kind, report.count(Category::Vulnerability), prompt)
                    .with_data(report.to_value()?);
            decisions.push(self.route(&router, &publisher, decision_context).await);
        }

        publisher
            .publish(EventType::AggregateUpdated, report.to_value()?)
            .await;

        let final_context = DecisionContext::new(
            DecisionKind::FinalReport,
            report.total_findings,
            format!("Write the final report. {}", report.summary()),
        )
        .with_data(report.to_value()?);
        let final_decision = self.route(&router, &publisher, final_context).await;
        let summary = match &final_decision.decision {
            Decision::Report { summary } if !summary.trim().is_empty() => summary.clone(),
            _ => report.summary(),
        };
        decisions.push(final_decision);

        let any_completed = runs
            .last()
            .map(|r| r.count("completed") > 0)
            .unwrap_or(false);
        let status = if self.cancel.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if !any_completed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let terminal = match status {
            WorkflowStatus::Cancelled => EventType::WorkflowCancelled,
            WorkflowStatus::Failed => EventType::WorkflowFailed,
            _ => EventType::WorkflowCompleted,
        };
        let budget = router.budget();
        publisher
            .publish(
                terminal,
                json!({
                    "status": status,
                    "summary": summary,
                    "total_findings": report.total_findings,
                    "spent": budget.total,
                }),
            )
            .await;
        self.record_workflow(run, status).await;

        run.persistence_failures += scheduler.persistence_failures();
        let mut warnings = Vec::new();
        if publisher.gaps() > 0 {
            warnings.push(WorkflowWarning::StreamGap {
                dropped: publisher.gaps(),
            });
        }
        if context.mirror_failures() > 0 {
            warnings.push(WorkflowWarning::MirrorFailures {
                count: context.mirror_failures(),
            });
        }
        if run.persistence_failures > 0 {
            warnings.push(WorkflowWarning::PersistenceFailures {
                count: run.persistence_failures,
            });
        }
        for warning in &warnings {
            rlog_warn!("[{}] {:?}", workflow_id.short(), warning);
        }
        rlog!(
            "[{}] workflow {}: {} findings, spent {}",
            workflow_id.short(),
            status,
            report.total_findings,
            budget.total
        );

        Ok(WorkflowOutcome {
            workflow_id,
            status,
            report,
            summary,
            decisions,
            budget,
            runs,
            warnings,
        })
    }

    async fn route(
        &self,
        router: &BudgetRouter,
        publisher: &EventPublisher,
        context: DecisionContext,
    ) -> RoutedDecision {
        let routed = router.decide(&context, &self.cancel).await;
        publisher
            .publish(
                EventType::DecisionRouted,
                json!({
                    "kind": routed.kind,
                    "decision": routed.decision,
                    "requested_tier": routed.requested_tier,
                    "answered_by": routed.answered_by,
                    "attempts": routed.attempts,
                    "budget_forced": routed.budget_forced,
                    "fallback_used": routed.fallback_used,
                    "cost": routed.cost,
                }),
            )
            .await;
        routed
    }

    async fn record_workflow(&self, run: &mut Run, status: WorkflowStatus) {
        self.statuses.set(run.workflow_id, status);
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store
            .record_workflow(run.workflow_id, run.target.raw(), status)
            .await
        {
            rlog_warn!(
                "[{}] failed to record workflow status {}: {}",
                run.workflow_id.short(),
                status,
                e
            );
            run.persistence_failures += 1;
        }
    }
}

/// State of one started workflow.
struct Run {
    workflow_id: WorkflowId,
    target: Target,
    resolver: Arc<DependencyResolver>,
    types: BTreeSet<TaskType>,
    publisher: Arc<EventPublisher>,
    context: SharedContext,
    persistence_failures: u64,
}
