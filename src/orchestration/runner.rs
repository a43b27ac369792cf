//! Boundary to the external recon tools.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::{FindingDraft, TaskType};

/// What a tool run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Opaque result payload stored on the task.
    pub result: Value,
    /// Findings to file into the shared context.
    pub findings: Vec<FindingDraft>,
}

impl TaskOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            findings: Vec::new(),
        }
    }

    pub fn with_finding(mut self, finding: FindingDraft) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn with_findings(mut self, findings: impl IntoIterator<Item = FindingDraft>) -> Self {
        self.findings.extend(findings);
        self
    }
}

/// Why a tool run did not produce output.
///
/// These never escape the scheduler; each maps to a terminal task status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Runs one recon tool.
///
/// Called concurrently for different tasks. Implementations should stop
/// promptly once `cancel` fires; the worker stops waiting either way.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        task_type: TaskType,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError>;
}
