//! Per-task-type parameter strategies.
//!
//! A strategy turns the current shared context and the workflow target into
//! concrete invocation parameters for one task type, or decides the task has
//! nothing to work on. Strategies only read the context and are
//! deterministic for a given snapshot, since every context query is ordered
//! by key.
//!
//! Finding value shapes the strategies rely on:
//!
//! | Category      | Key                 | Value fields                         |
//! |---------------|---------------------|--------------------------------------|
//! | host          | hostname            | `source`                             |
//! | address       | hostname            | `addresses`                          |
//! | port          | `host:port`         | `host`, `port`, `service`            |
//! | web           | base URL            | `host`, `port`, `scheme`, `status`   |
//! | technology    | `url#name`          | `url`, `name`, `version`             |
//! | vulnerability | `template@url`      | `url`, `host`, `name`, `severity`    |

mod discovery;
mod web;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{SharedContext, Target, TaskType};

pub use discovery::{DnsResolutionStrategy, PortScanStrategy, SubdomainDiscoveryStrategy};
pub use web::{
    ContentDiscoveryStrategy, HttpProbeStrategy, TechFingerprintStrategy, TlsInspectionStrategy,
    VulnerabilityScanStrategy,
};

/// What a strategy does when the findings it feeds on are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPolicy {
    /// Scan the raw target directly.
    Degrade,
    /// Skip the task.
    Skip,
    /// The strategy reads no findings (root of the graph).
    NotApplicable,
}

/// Parameters chosen for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPlan {
    pub params: Value,
    pub reasoning: String,
    /// Overrides the task's submitted priority when set.
    pub priority: Option<u8>,
}

/// Result of [`ParameterStrategy::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StrategyOutcome {
    Run(StrategyPlan),
    Skip { reasoning: String },
}

impl StrategyOutcome {
    pub fn run(params: Value, reasoning: impl Into<String>) -> Self {
        StrategyOutcome::Run(StrategyPlan {
            params,
            reasoning: reasoning.into(),
            priority: None,
        })
    }

    pub fn skip(reasoning: impl Into<String>) -> Self {
        StrategyOutcome::Skip {
            reasoning: reasoning.into(),
        }
    }

    pub fn with_priority(self, priority: u8) -> Self {
        match self {
            StrategyOutcome::Run(plan) => StrategyOutcome::Run(StrategyPlan {
                priority: Some(priority),
                ..plan
            }),
            skip => skip,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, StrategyOutcome::Skip { .. })
    }
}

/// Builds parameters for one task type.
pub trait ParameterStrategy: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// How this strategy reacts to an empty input category.
    fn empty_policy(&self) -> EmptyPolicy;

    fn build(&self, context: &SharedContext, target: &Target) -> StrategyOutcome;
}

/// Strategy for a task type.
///
/// The match is exhaustive over [`TaskType`], so adding a type without a
/// strategy fails to compile.
pub fn strategy_for(task_type: TaskType) -> &'static dyn ParameterStrategy {
    match task_type {
        TaskType::SubdomainDiscovery => &SubdomainDiscoveryStrategy,
        TaskType::DnsResolution => &DnsResolutionStrategy,
        TaskType::PortScan => &PortScanStrategy,
        TaskType::HttpProbe => &HttpProbeStrategy,
        TaskType::TlsInspection => &TlsInspectionStrategy,
        TaskType::TechFingerprint => &TechFingerprintStrategy,
        TaskType::ContentDiscovery => &ContentDiscoveryStrategy,
        TaskType::VulnerabilityScan => &VulnerabilityScanStrategy,
    }
}

/// Apply an empty-input policy.
///
/// `degraded` is only evaluated under [`EmptyPolicy::Degrade`].
pub(crate) fn on_empty<F>(policy: EmptyPolicy, missing: &str, degraded: F) -> StrategyOutcome
where
    F: FnOnce() -> StrategyOutcome,
{
    match policy {
        EmptyPolicy::Degrade => degraded(),
        EmptyPolicy::Skip | EmptyPolicy::NotApplicable => {
            StrategyOutcome::skip(format!("no {} findings to work from", missing))
        }
    }
}
