//! Workflow identity and lifecycle types.

mod types;

pub use types::{WorkflowId, WorkflowStatus};
