//! Budget router integration tests.
//!
//! These tests verify tier selection, the spend ceiling, and the
//! retry/downgrade/fallback policy, both on the router directly and
//! through a whole workflow.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use reconflow::config::{BudgetConfig, Config};
use reconflow::orchestration::{
    BudgetRouter, Cost, Decision, DecisionContext, DecisionKind, Tier,
};
use reconflow::stream::{EventLog, EventType};
use reconflow::WorkflowRequest;

use crate::fixtures::{Harness, ScriptedProvider, ScriptedRunner, TARGET};

fn router(light: &Arc<ScriptedProvider>, deep: &Arc<ScriptedProvider>) -> BudgetRouter {
    BudgetRouter::new(light.clone(), deep.clone(), &BudgetConfig::default())
}

fn final_report() -> DecisionContext {
    DecisionContext::new(DecisionKind::FinalReport, 1, "write the report")
}

/// Test: Budget enforcement
/// Given limit 0.05, lightweight 0.0001/call and deep 0.001/call
/// When 50 deep calls have been made
/// Then every later decision goes lightweight until the ledger is reset
#[tokio::test]
async fn test_budget_ceiling_forces_lightweight() {
    let light = Arc::new(ScriptedProvider::lightweight());
    let deep = Arc::new(ScriptedProvider::deep());
    let router = router(&light, &deep);
    let cancel = CancellationToken::new();

    for _ in 0..50 {
        let routed = router.decide(&final_report(), &cancel).await;
        assert_eq!(routed.answered_by, Some(Tier::Deep));
    }
    let budget = router.budget();
    assert_eq!(budget.total, Cost::from_units(0.05));
    assert!(budget.is_exhausted());
    assert_eq!(budget.calls_on(Tier::Deep), 50);

    let signals = [
        DecisionContext::new(DecisionKind::FinalReport, 1, "report"),
        DecisionContext::new(DecisionKind::Escalation, 1, "escalate"),
        DecisionContext::new(DecisionKind::NextSteps, 10_000, "huge"),
        DecisionContext::new(DecisionKind::Triage, 0, "small"),
    ];
    for context in &signals {
        assert_eq!(router.route(context), Tier::Lightweight);
        let routed = router.decide(context, &cancel).await;
        assert_eq!(routed.answered_by, Some(Tier::Lightweight));
        assert!(routed.budget_forced);
    }
    assert_eq!(deep.call_count(), 50);
    assert_eq!(light.call_count(), signals.len());

    router.reset();
    assert_eq!(router.route(&final_report()), Tier::Deep);
}

/// Test: A fresh workflow starts with a fresh ledger
#[tokio::test]
async fn test_new_router_has_fresh_budget() {
    let light = Arc::new(ScriptedProvider::lightweight());
    let deep = Arc::new(ScriptedProvider::deep());
    let cancel = CancellationToken::new();
    let first = router(&light, &deep);
    for _ in 0..50 {
        first.decide(&final_report(), &cancel).await;
    }
    assert_eq!(first.route(&final_report()), Tier::Lightweight);

    let second = router(&light, &deep);
    assert_eq!(second.route(&final_report()), Tier::Deep);
}

/// Test: Classification rules in order
#[test]
fn test_route_classification() {
    let light = Arc::new(ScriptedProvider::lightweight());
    let deep = Arc::new(ScriptedProvider::deep());
    let router = router(&light, &deep);
    let threshold = BudgetConfig::default().deep_item_threshold;

    assert_eq!(
        router.route(&DecisionContext::new(DecisionKind::Escalation, 0, "")),
        Tier::Deep
    );
    assert_eq!(
        router.route(&DecisionContext::new(DecisionKind::NextSteps, threshold, "")),
        Tier::Lightweight
    );
    assert_eq!(
        router.route(&DecisionContext::new(DecisionKind::NextSteps, threshold + 1, "")),
        Tier::Deep
    );
    assert_eq!(
        router.route(&DecisionContext::new(DecisionKind::Triage, 3, "")),
        Tier::Lightweight
    );
}

/// Test: Retry once, downgrade, then answer
/// Given the deep provider fails twice with partial usage
/// Then the lightweight provider answers and all partial cost is recorded
#[tokio::test]
async fn test_deep_failures_downgrade() {
    let partial = Cost::from_units(0.0002);
    let light = Arc::new(ScriptedProvider::lightweight());
    let deep = Arc::new(ScriptedProvider::deep().failing(2, partial));
    let router = router(&light, &deep);

    let routed = router.decide(&final_report(), &CancellationToken::new()).await;
    assert_eq!(routed.requested_tier, Tier::Deep);
    assert_eq!(routed.answered_by, Some(Tier::Lightweight));
    assert_eq!(routed.attempts, 3);
    assert!(!routed.fallback_used);
    assert_eq!(routed.cost, Cost::from_units(0.0005));
    assert_eq!(router.budget().spent_on(Tier::Deep), Cost::from_units(0.0004));
    assert_eq!(router.budget().spent_on(Tier::Lightweight), Cost::from_units(0.0001));
}

/// Test: Deterministic fallback when every tier fails
#[tokio::test]
async fn test_all_tiers_fail_falls_back() {
    let light = Arc::new(ScriptedProvider::lightweight().failing(u32::MAX, Cost::ZERO));
    let deep = Arc::new(ScriptedProvider::deep().failing(u32::MAX, Cost::ZERO));
    let router = router(&light, &deep);
    let cancel = CancellationToken::new();

    let escalation = DecisionContext::new(DecisionKind::Escalation, 2, "two criticals");
    let routed = router.decide(&escalation, &cancel).await;
    assert!(routed.fallback_used);
    assert_eq!(routed.answered_by, None);
    assert_eq!(routed.decision, Decision::fallback_for(DecisionKind::Escalation));
    assert_eq!(deep.call_count(), 2);
    assert_eq!(light.call_count(), 1);

    let next = DecisionContext::new(DecisionKind::NextSteps, 0, "anything else?");
    let routed = router.decide(&next, &cancel).await;
    assert!(matches!(routed.decision, Decision::NoFurtherAction { .. }));
    assert_eq!(light.call_count(), 3);
}

/// Test: Budget exhaustion inside a workflow
/// Given a limit one deep call can exhaust
/// When the workflow escalates and reports
/// Then the report is forced onto the lightweight tier, the workflow
/// still completes, and exhaustion is announced exactly once
#[tokio::test]
async fn test_workflow_budget_exhaustion() {
    let mut config = Config::default();
    config.budget.limit = 0.001;
    let harness = Harness::with(
        config,
        ScriptedRunner::recon(),
        ScriptedProvider::lightweight(),
        ScriptedProvider::deep(),
    );
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert!(outcome.budget.is_exhausted());
    let escalation = outcome.decisions_of(DecisionKind::Escalation).next().unwrap();
    assert_eq!(escalation.answered_by, Some(Tier::Deep));
    let report = outcome.decisions_of(DecisionKind::FinalReport).next().unwrap();
    assert_eq!(report.requested_tier, Tier::Lightweight);
    assert!(report.budget_forced);
    assert_eq!(outcome.summary, "report by lightweight");
    assert_eq!(harness.deep.calls(), vec![DecisionKind::Escalation]);

    let events = harness
        .orchestrator
        .event_log()
        .read_after(outcome.workflow_id, 0)
        .await
        .unwrap();
    let announcements = events
        .iter()
        .filter(|e| e.event_type == EventType::BudgetExhausted)
        .count();
    assert_eq!(announcements, 1);
}
