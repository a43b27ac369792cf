//! Core domain models for reconflow.
//!
//! This module contains the fundamental data structures shared by the
//! engine: tasks and their lifecycle, findings and the shared store they
//! live in, the workflow target, and the task-type dependency graph.

pub mod context;
pub mod dag;
pub mod finding;
pub mod target;
pub mod task;

pub use context::{FindingMirror, SharedContext};
pub use dag::{DependencyResolver, ProgressMap, Readiness, TypeProgress, Wave};
pub use finding::{Category, Finding, FindingDraft, Severity};
pub use target::{Target, TargetKind};
pub use task::{SkipReason, Task, TaskId, TaskStatus, TaskType};
