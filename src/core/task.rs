//! Task data model for the scheduler.
//!
//! Tasks are the atomic units of work handed to the task runner. Each
//! task tracks its type, status, parameters, timing and result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::core::finding::Category;
use crate::error::{Error, Result};

/// Unique identifier for a task within a workflow.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The closed set of recon tasks the engine knows how to schedule.
///
/// Declaration order is the canonical order used inside a wave.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SubdomainDiscovery,
    DnsResolution,
    PortScan,
    HttpProbe,
    TlsInspection,
    TechFingerprint,
    ContentDiscovery,
    VulnerabilityScan,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::SubdomainDiscovery,
        TaskType::DnsResolution,
        TaskType::PortScan,
        TaskType::HttpProbe,
        TaskType::TlsInspection,
        TaskType::TechFingerprint,
        TaskType::ContentDiscovery,
        TaskType::VulnerabilityScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SubdomainDiscovery => "subdomain_discovery",
            TaskType::DnsResolution => "dns_resolution",
            TaskType::PortScan => "port_scan",
            TaskType::HttpProbe => "http_probe",
            TaskType::TlsInspection => "tls_inspection",
            TaskType::TechFingerprint => "tech_fingerprint",
            TaskType::ContentDiscovery => "content_discovery",
            TaskType::VulnerabilityScan => "vulnerability_scan",
        }
    }

    /// Task types that must be fully resolved before this one is ready.
    pub fn depends_on(&self) -> &'static [TaskType] {
        match self {
            TaskType::SubdomainDiscovery => &[],
            TaskType::DnsResolution | TaskType::PortScan => &[TaskType::SubdomainDiscovery],
            TaskType::HttpProbe | TaskType::TlsInspection => &[TaskType::PortScan],
            TaskType::TechFingerprint | TaskType::ContentDiscovery => &[TaskType::HttpProbe],
            TaskType::VulnerabilityScan => &[TaskType::HttpProbe, TaskType::TechFingerprint],
        }
    }

    /// Categories this task type is allowed to write into the shared context.
    pub fn produces(&self) -> &'static [Category] {
        match self {
            TaskType::SubdomainDiscovery => &[Category::Host],
            TaskType::DnsResolution => &[Category::Address],
            TaskType::PortScan => &[Category::Port],
            TaskType::HttpProbe => &[Category::Web],
            TaskType::TlsInspection => &[Category::Certificate],
            TaskType::TechFingerprint => &[Category::Technology],
            TaskType::ContentDiscovery => &[Category::Endpoint],
            TaskType::VulnerabilityScan => &[Category::Vulnerability],
        }
    }

    /// Default scheduling priority (lower runs first).
    pub fn default_priority(&self) -> u8 {
        match self {
            TaskType::SubdomainDiscovery => 1,
            TaskType::PortScan | TaskType::HttpProbe | TaskType::VulnerabilityScan => 2,
            TaskType::DnsResolution | TaskType::TechFingerprint => 3,
            TaskType::TlsInspection => 4,
            TaskType::ContentDiscovery => 5,
        }
    }

    /// Default execution timeout before the task is marked timed out.
    pub fn default_timeout(&self) -> Duration {
        match self {
            TaskType::DnsResolution | TaskType::HttpProbe | TaskType::TlsInspection => {
                Duration::from_secs(120)
            }
            TaskType::SubdomainDiscovery | TaskType::TechFingerprint => Duration::from_secs(300),
            TaskType::PortScan | TaskType::ContentDiscovery => Duration::from_secs(600),
            TaskType::VulnerabilityScan => Duration::from_secs(900),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type: {}", s))
    }
}

/// Why a task was skipped instead of executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SkipReason {
    /// A task of a depended-on type did not complete.
    ///
    /// `task_id` is the root task whose failure triggered the skip.
    DependencyFailed {
        task_id: TaskId,
        task_type: TaskType,
    },
    /// No task of a depended-on type was ever scheduled.
    DependencyUnavailable { task_type: TaskType },
    /// The parameter strategy found nothing to work on.
    NoInput { reasoning: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DependencyFailed { task_id, task_type } => {
                write!(f, "dependency {} ({}) did not complete", task_type, task_id.short())
            }
            SkipReason::DependencyUnavailable { task_type } => {
                write!(f, "dependency {} was never scheduled", task_type)
            }
            SkipReason::NoInput { reasoning } => write!(f, "no input: {}", reasoning),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending → Ready → Assigned → Running → {Completed | Failed | TimedOut | Cancelled}`,
/// plus `Pending → Skipped` and cancellation of anything not yet running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies resolved and parameters built; queued for a worker.
    Ready,
    /// Holding a worker slot, runner not yet invoked.
    Assigned,
    /// Runner invoked.
    Running,
    Completed,
    Failed {
        error: String,
    },
    TimedOut {
        timeout_ms: u64,
    },
    Cancelled,
    Skipped {
        reason: SkipReason,
    },
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed { .. }
                | TaskStatus::TimedOut { .. }
                | TaskStatus::Cancelled
                | TaskStatus::Skipped { .. }
        )
    }

    /// Terminal, but not `Completed`. Dependents of such a task are skipped.
    pub fn is_unsuccessful(&self) -> bool {
        self.is_terminal() && *self != TaskStatus::Completed
    }

    /// Short label, used for persistence and counters.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::TimedOut { .. } => "timed_out",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }

    fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped { .. })
                | (Pending, Cancelled)
                | (Ready, Assigned)
                | (Ready, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed { .. })
                | (Running, TimedOut { .. })
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::TimedOut { timeout_ms } => write!(f, "timed out after {}ms", timeout_ms),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A single unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    /// Lower is more urgent.
    pub priority: u8,
    pub depends_on: BTreeSet<TaskType>,
    pub status: TaskStatus,
    /// Submission order within the scheduler; breaks priority ties.
    pub seq: u64,
    /// Invocation parameters, either supplied at submit or built by the strategy.
    pub params: Option<Value>,
    /// Why the strategy chose these parameters (or skipped).
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl Task {
    /// Create a pending task of the given type.
    pub fn new(task_type: TaskType, seq: u64) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            priority: task_type.default_priority(),
            depends_on: task_type.depends_on().iter().copied().collect(),
            status: TaskStatus::Pending,
            seq,
            params: None,
            reasoning: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_depends_on(mut self, depends_on: BTreeSet<TaskType>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// Records `started_at` on entering Running and `completed_at` on
    /// entering any terminal status.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.status.clone(),
                to: next,
            });
        }
        if next == TaskStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Record the runner's result payload and complete the task.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn error(&self) -> Option<String> {
        match &self.status {
            TaskStatus::Failed { error } => Some(error.clone()),
            TaskStatus::TimedOut { .. } | TaskStatus::Skipped { .. } => {
                Some(self.status.to_string())
            }
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
