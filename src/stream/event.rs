//! Progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowId;
use crate::{Error, Result};

/// Kind of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    PlanComputed,
    TaskSubmitted,
    TaskReady,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimedOut,
    TaskCancelled,
    TaskSkipped,
    DecisionRouted,
    BudgetExhausted,
    AggregateUpdated,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl EventType {
    pub const ALL: [EventType; 16] = [
        EventType::WorkflowStarted,
        EventType::PlanComputed,
        EventType::TaskSubmitted,
        EventType::TaskReady,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskTimedOut,
        EventType::TaskCancelled,
        EventType::TaskSkipped,
        EventType::DecisionRouted,
        EventType::BudgetExhausted,
        EventType::AggregateUpdated,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::WorkflowCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::PlanComputed => "plan_computed",
            EventType::TaskSubmitted => "task_submitted",
            EventType::TaskReady => "task_ready",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::TaskTimedOut => "task_timed_out",
            EventType::TaskCancelled => "task_cancelled",
            EventType::TaskSkipped => "task_skipped",
            EventType::DecisionRouted => "decision_routed",
            EventType::BudgetExhausted => "budget_exhausted",
            EventType::AggregateUpdated => "aggregate_updated",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowCancelled => "workflow_cancelled",
        }
    }

    /// The last event a workflow emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted | EventType::WorkflowFailed | EventType::WorkflowCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown event type: {}", s)))
    }
}

/// One durable, sequenced progress record.
///
/// Sequences start at 1 per workflow and never skip or repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub workflow_id: WorkflowId,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
