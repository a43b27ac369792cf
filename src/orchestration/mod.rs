//! Orchestration layer for reconflow.
//!
//! This module runs a workflow end to end: the dependency-aware
//! [`Scheduler`] and its [`WorkerPool`], the tiered [`BudgetRouter`] for
//! reasoning-provider decisions, the read-side [`ResultAggregator`], and
//! the [`Orchestrator`] that wires them into the workflow lifecycle.

mod aggregator;
mod budget;
mod orchestrator;
mod pool;
mod router;
mod runner;
mod scheduler;

pub use aggregator::{
    AggregateReport, CategorySummary, Correlations, ResultAggregator, DEFAULT_PREVIEW_LIMIT,
};
pub use budget::{Budget, Cost, Tier};
pub use orchestrator::{Orchestrator, WorkflowOutcome, WorkflowRequest, WorkflowWarning};
pub use pool::{WorkerEvent, WorkerHandle, WorkerId, WorkerPool};
pub use router::{
    BudgetRouter, Decision, DecisionContext, DecisionKind, DecisionProvider, ProviderError,
    ProviderFailure, ProviderReply, RoutedDecision,
};
pub use runner::{TaskError, TaskOutput, TaskRunner};
pub use scheduler::{RunSummary, Scheduler, SchedulerHandle};
