pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod util;
pub mod workflow;

// Engine
pub mod orchestration;
pub mod storage;
pub mod strategy;
pub mod stream;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, WorkflowOutcome, WorkflowRequest, WorkflowWarning};
pub use workflow::{WorkflowId, WorkflowStatus};
