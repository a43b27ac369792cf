//! Persistence of workflow state.

mod database;

use async_trait::async_trait;

use crate::core::Task;
use crate::workflow::{WorkflowId, WorkflowStatus};
use crate::Result;

pub use database::Database;

/// Durable record of workflow and task state.
///
/// The scheduler writes every task transition through this trait; a
/// failed write is logged and never fails the task.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn record_workflow(
        &self,
        workflow_id: WorkflowId,
        target: &str,
        status: WorkflowStatus,
    ) -> Result<()>;

    async fn record_task(&self, workflow_id: WorkflowId, task: &Task) -> Result<()>;
}
