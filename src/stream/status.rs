//! Workflow status lookups for stream consumers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::workflow::{WorkflowId, WorkflowStatus};
use crate::Result;

/// Where a consumer learns that a workflow has ended.
///
/// The terminal event can be lost if the log rejects it, so consumers also
/// ask this source once the log runs dry.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Latest recorded status, or `None` for an unknown workflow.
    async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowStatus>>;
}

/// In-process status table kept by the orchestrator.
#[derive(Debug, Default)]
pub struct StatusBoard {
    statuses: Mutex<HashMap<WorkflowId, WorkflowStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, workflow_id: WorkflowId, status: WorkflowStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_id, status);
    }

    pub fn get(&self, workflow_id: WorkflowId) -> Option<WorkflowStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&workflow_id)
            .copied()
    }
}

#[async_trait]
impl StatusSource for StatusBoard {
    async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowStatus>> {
        Ok(self.get(workflow_id))
    }
}
