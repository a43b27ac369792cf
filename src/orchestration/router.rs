//! Tiered, budget-gated routing of decision points.
//!
//! Every decision goes through [`BudgetRouter::decide`], which owns the one
//! retry policy: retry once on the chosen tier, then downgrade to the
//! lightweight tier, then fall back to a deterministic default. A reasoning
//! provider being unavailable never blocks the workflow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BudgetConfig;
use crate::core::TaskType;
use crate::orchestration::budget::{Budget, Cost, Tier};
use crate::stream::{EventPublisher, EventType};
use crate::{rlog, rlog_debug, rlog_warn};

/// Kind of decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Whether more task types should run.
    NextSteps,
    /// Sorting lower-severity vulnerabilities.
    Triage,
    /// High or critical findings need attention.
    Escalation,
    /// Summary of the finished workflow.
    FinalReport,
}

impl DecisionKind {
    /// Kinds always routed to the deep tier while budget remains.
    pub fn is_mandatory_deep(&self) -> bool {
        matches!(self, DecisionKind::Escalation | DecisionKind::FinalReport)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::NextSteps => "next_steps",
            DecisionKind::Triage => "triage",
            DecisionKind::Escalation => "escalation",
            DecisionKind::FinalReport => "final_report",
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to a decision provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub kind: DecisionKind,
    /// Quantitative signal used for tier selection (findings in scope).
    pub item_count: usize,
    pub prompt: String,
    pub data: Value,
}

impl DecisionContext {
    pub fn new(kind: DecisionKind, item_count: usize, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            item_count,
            prompt: prompt.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// A provider's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Decision {
    /// Schedule these task types (again).
    RunTasks {
        task_types: Vec<TaskType>,
        reasoning: String,
    },
    /// Nothing to do; also the typed "no answer".
    NoFurtherAction { reasoning: String },
    Escalate { summary: String },
    Report { summary: String },
}

impl Decision {
    /// Deterministic default used when no provider answered.
    pub fn fallback_for(kind: DecisionKind) -> Self {
        match kind {
            DecisionKind::NextSteps | DecisionKind::Triage => Decision::NoFurtherAction {
                reasoning: format!("no provider answered the {} decision", kind),
            },
            DecisionKind::Escalation => Decision::Escalate {
                summary: "high-severity findings require manual review".to_string(),
            },
            DecisionKind::FinalReport => Decision::Report {
                summary: String::new(),
            },
        }
    }
}

/// A successful provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    pub decision: Decision,
    pub cost: Cost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider quota exceeded: {0}")]
    Quota(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// A failed provider call, with whatever it cost before failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub error: ProviderError,
    pub partial_cost: Cost,
}

impl ProviderFailure {
    pub fn with_cost(error: ProviderError, partial_cost: Cost) -> Self {
        Self {
            error,
            partial_cost,
        }
    }
}

impl From<ProviderError> for ProviderFailure {
    fn from(error: ProviderError) -> Self {
        Self::with_cost(error, Cost::ZERO)
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (cost {})", self.error, self.partial_cost)
    }
}

/// A reasoning provider at one tier.
///
/// Expected "no answer" conditions are returned as
/// [`Decision::NoFurtherAction`], never as errors.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(
        &self,
        context: &DecisionContext,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure>;
}

/// Outcome of [`BudgetRouter::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedDecision {
    pub kind: DecisionKind,
    pub decision: Decision,
    /// Tier classification chose before any failure.
    pub requested_tier: Tier,
    /// Tier that answered; `None` when the fallback was used.
    pub answered_by: Option<Tier>,
    pub attempts: u32,
    /// The spent budget forced the lightweight tier.
    pub budget_forced: bool,
    pub fallback_used: bool,
    /// Everything recorded for this decision, failures included.
    pub cost: Cost,
}

/// How one provider call ended.
enum Attempt {
    Answered(ProviderReply),
    Failed(ProviderFailure),
    Cancelled,
}

/// Chooses a tier per decision and enforces the spend ceiling.
pub struct BudgetRouter {
    lightweight: Arc<dyn DecisionProvider>,
    deep: Arc<dyn DecisionProvider>,
    budget: Mutex<Budget>,
    deep_item_threshold: usize,
    provider_timeout: Duration,
    publisher: Option<Arc<EventPublisher>>,
    exhaustion_announced: AtomicBool,
}

impl BudgetRouter {
    pub fn new(
        lightweight: Arc<dyn DecisionProvider>,
        deep: Arc<dyn DecisionProvider>,
        config: &BudgetConfig,
    ) -> Self {
        Self {
            lightweight,
            deep,
            budget: Mutex::new(Budget::new(config.limit_cost())),
            deep_item_threshold: config.deep_item_threshold,
            provider_timeout: config.provider_timeout(),
            publisher: None,
            exhaustion_announced: AtomicBool::new(false),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Budget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the ledger.
    pub fn budget(&self) -> Budget {
        self.ledger().clone()
    }

    /// Clear spend for a new workflow.
    pub fn reset(&self) {
        self.ledger().reset();
        self.exhaustion_announced.store(false, Ordering::SeqCst);
    }

    /// Pick a tier; first matching rule wins:
    /// spent budget, mandatory-deep kind, item count over threshold, else
    /// lightweight.
    pub fn route(&self, context: &DecisionContext) -> Tier {
        self.classify(context).0
    }

    /// Tier plus whether the budget forced it.
    fn classify(&self, context: &DecisionContext) -> (Tier, bool) {
        if self.ledger().is_exhausted() {
            return (Tier::Lightweight, true);
        }
        if context.kind.is_mandatory_deep() || context.item_count > self.deep_item_threshold {
            return (Tier::Deep, false);
        }
        (Tier::Lightweight, false)
    }

    /// Add a call's cost to the ledger.
    ///
    /// Returns whether this call exhausted the budget.
    pub fn record(&self, tier: Tier, cost: Cost) -> bool {
        let mut ledger = self.ledger();
        let crossed = ledger.record(tier, cost);
        if crossed {
            rlog!(
                "Decision budget exhausted: spent {} of {}",
                ledger.total,
                ledger.limit
            );
        }
        crossed
    }

    fn provider(&self, tier: Tier) -> &Arc<dyn DecisionProvider> {
        match tier {
            Tier::Lightweight => &self.lightweight,
            Tier::Deep => &self.deep,
        }
    }

    /// Route and answer one decision point.
    pub async fn decide(
        &self,
        context: &DecisionContext,
        cancel: &CancellationToken,
    ) -> RoutedDecision {
        let (requested_tier, mut budget_forced) = self.classify(context);
        let mut plan: VecDeque<Tier> = match requested_tier {
            Tier::Deep => VecDeque::from([Tier::Deep, Tier::Deep, Tier::Lightweight]),
            Tier::Lightweight => VecDeque::from([Tier::Lightweight, Tier::Lightweight]),
        };
        let mut attempts = 0;
        let mut cost = Cost::ZERO;
        let mut cancelled = false;

        while let Some(mut tier) = plan.pop_front() {
            if cancel.is_cancelled() {
                rlog_debug!("{} decision cancelled before attempt {}", context.kind, attempts + 1);
                cancelled = true;
                break;
            }
            if tier == Tier::Deep && self.ledger().is_exhausted() {
                // Budget ran out mid-decision: one lightweight attempt plus
                // its retry.
                budget_forced = true;
                tier = Tier::Lightweight;
                plan = VecDeque::from([Tier::Lightweight]);
            }

            attempts += 1;
            match self.attempt(tier, context, cancel).await {
                Attempt::Answered(reply) => {
                    cost += reply.cost;
                    self.charge(tier, reply.cost).await;
                    rlog_debug!(
                        "{} decision answered by {} after {} attempt(s)",
                        context.kind,
                        tier,
                        attempts
                    );
                    return RoutedDecision {
                        kind: context.kind,
                        decision: reply.decision,
                        requested_tier,
                        answered_by: Some(tier),
                        attempts,
                        budget_forced,
                        fallback_used: false,
                        cost,
                    };
                }
                Attempt::Cancelled => {
                    rlog_debug!(
                        "{} decision attempt {} on {} cancelled",
                        context.kind,
                        attempts,
                        tier
                    );
                    cancelled = true;
                    break;
                }
                Attempt::Failed(failure) => {
                    rlog_warn!(
                        "{} decision attempt {} on {} ({}) failed: {}",
                        context.kind,
                        attempts,
                        tier,
                        self.provider(tier).name(),
                        failure
                    );
                    if !failure.partial_cost.is_zero() {
                        cost += failure.partial_cost;
                        self.charge(tier, failure.partial_cost).await;
                    }
                }
            }
        }

        if cancelled {
            rlog_debug!("{} decision cancelled; using the default", context.kind);
        } else {
            rlog_warn!("{} decision falling back to the default", context.kind);
        }
        RoutedDecision {
            kind: context.kind,
            decision: Decision::fallback_for(context.kind),
            requested_tier,
            answered_by: None,
            attempts,
            budget_forced,
            fallback_used: true,
            cost,
        }
    }

    /// One provider call bounded by the provider timeout and cancellation.
    async fn attempt(
        &self,
        tier: Tier,
        context: &DecisionContext,
        cancel: &CancellationToken,
    ) -> Attempt {
        let provider = self.provider(tier);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Cancelled,
            outcome = tokio::time::timeout(
                self.provider_timeout,
                provider.decide(context, self.provider_timeout),
            ) => match outcome {
                Ok(Ok(reply)) => Attempt::Answered(reply),
                Ok(Err(failure)) => Attempt::Failed(failure),
                Err(_) => Attempt::Failed(ProviderError::Timeout(self.provider_timeout).into()),
            },
        }
    }

    /// Record spend and announce exhaustion once.
    async fn charge(&self, tier: Tier, cost: Cost) {
        if !self.record(tier, cost) {
            return;
        }
        if self.exhaustion_announced.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(publisher) = &self.publisher {
            let budget = self.budget();
            publisher
                .publish(
                    EventType::BudgetExhausted,
                    json!({ "limit": budget.limit, "spent": budget.total, "by_tier": budget.spent }),
                )
                .await;
        }
    }
}

impl std::fmt::Debug for BudgetRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetRouter")
            .field("lightweight", &self.lightweight.name())
            .field("deep", &self.deep.name())
            .field("budget", &self.budget())
            .finish()
    }
}
