//! End-to-end workflow integration tests.
//!
//! These tests drive the full lifecycle through `Orchestrator::run`:
//! plan, scheduled execution, decision rounds, escalation, aggregation
//! and the final report. Task runners and reasoning providers are scripted.

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use reconflow::config::Config;
use reconflow::core::{Category, SharedContext, TaskId, TaskStatus, TaskType};
use reconflow::orchestration::{Decision, DecisionKind, ResultAggregator, Tier};
use reconflow::storage::Database;
use reconflow::stream::{EventLog, EventType};
use reconflow::{Error, WorkflowId, WorkflowRequest, WorkflowStatus, WorkflowWarning};

use crate::fixtures::{
    assert_contiguous, FlakyEventLog, Harness, Script, ScriptedProvider, ScriptedRunner, TARGET,
};

/// Test: E2E Happy Path
/// Given scripted runs for every task type
/// When the full catalogue runs against one domain
/// Then every task completes and the deep tier escalates and reports
#[tokio::test]
async fn test_e2e_full_catalogue() {
    let harness = Harness::new(ScriptedRunner::recon());
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.runs[0].count("completed"), TaskType::ALL.len());
    assert_eq!(outcome.runs[0].drain_order[0], TaskType::SubdomainDiscovery);
    assert_eq!(outcome.runs[0].waves.len(), 5);

    let report = &outcome.report;
    assert_eq!(report.total_findings, 14);
    assert_eq!(report.count(Category::Port), 4);
    assert_eq!(report.severe_count(), 1);
    assert_eq!(report.correlations.vulnerable_hosts, vec!["www.example.com"]);
    assert_eq!(report.correlations.unresolved_hosts, vec!["api.example.com"]);
    assert_eq!(report.correlations.web_without_tls, vec!["api.example.com"]);

    // One quiet next-steps round, then escalation and the final report.
    let kinds: Vec<DecisionKind> = outcome.decisions.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        vec![
            DecisionKind::NextSteps,
            DecisionKind::Escalation,
            DecisionKind::FinalReport
        ]
    );
    let escalation = outcome.decisions_of(DecisionKind::Escalation).next().unwrap();
    assert_eq!(escalation.answered_by, Some(Tier::Deep));
    assert_eq!(outcome.summary, "report by deep");
    assert_eq!(harness.deep.call_count(), 2);
    assert_eq!(harness.lightweight.call_count(), 1);
    assert!(outcome.warnings.is_empty());

    let events = harness
        .orchestrator
        .event_log()
        .read_after(outcome.workflow_id, 0)
        .await
        .unwrap();
    assert_contiguous(&events, 1);
    assert_eq!(events[0].event_type, EventType::WorkflowStarted);
    assert_eq!(events[1].event_type, EventType::PlanComputed);
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowCompleted);
    let completed = events
        .iter()
        .filter(|e| e.event_type == EventType::TaskCompleted)
        .count();
    assert_eq!(completed, TaskType::ALL.len());
    assert!(events.iter().any(|e| e.event_type == EventType::AggregateUpdated));
}

/// Test: Requested types pull in their dependencies
#[tokio::test]
async fn test_e2e_request_closure() {
    let harness = Harness::new(ScriptedRunner::recon());
    let request = WorkflowRequest::new(TARGET).with_task_types([TaskType::DnsResolution]);
    let outcome = harness.orchestrator.run(request).await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(
        harness.runner.started_order(),
        vec![TaskType::SubdomainDiscovery, TaskType::DnsResolution]
    );
    let dns = &harness.runner.runs_of(TaskType::DnsResolution)[0];
    assert_eq!(
        dns.params["hosts"],
        json!(["api.example.com", "www.example.com"])
    );
}

/// Test: Supplied parameters bypass the strategy
#[tokio::test]
async fn test_e2e_supplied_params() {
    let harness = Harness::new(ScriptedRunner::recon());
    let params = json!({ "domain": "example.com", "mode": "custom" });
    let request = WorkflowRequest::new(TARGET)
        .with_task_types([TaskType::SubdomainDiscovery])
        .with_params(TaskType::SubdomainDiscovery, params.clone());
    harness.orchestrator.run(request).await.unwrap();

    assert_eq!(harness.runner.runs_of(TaskType::SubdomainDiscovery)[0].params, params);
}

/// Test: Root failure
/// Given subdomain discovery fails
/// When the workflow runs
/// Then every other task is skipped and the workflow fails
#[tokio::test]
async fn test_e2e_root_failure_fails_workflow() {
    let runner = ScriptedRunner::recon().script(
        TaskType::SubdomainDiscovery,
        Script::Fail("resolver unreachable".to_string()),
    );
    let harness = Harness::new(runner);
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.runs[0].count("failed"), 1);
    assert_eq!(outcome.runs[0].count("skipped"), TaskType::ALL.len() - 1);
    assert_eq!(harness.runner.started_order(), vec![TaskType::SubdomainDiscovery]);
    assert_eq!(outcome.report.total_findings, 0);
    assert!(outcome.decisions_of(DecisionKind::Escalation).next().is_none());

    let events = harness
        .orchestrator
        .event_log()
        .read_after(outcome.workflow_id, 0)
        .await
        .unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowFailed);
}

/// Test: Next-steps decision schedules more work
/// Given a plan limited to port scanning
/// When the lightweight provider asks for TLS inspection
/// Then a second scheduler run executes only that type
#[tokio::test]
async fn test_e2e_decision_round_schedules_tasks() {
    let lightweight = ScriptedProvider::lightweight().answer(
        DecisionKind::NextSteps,
        Decision::RunTasks {
            task_types: vec![TaskType::TlsInspection],
            reasoning: "443 is open".to_string(),
        },
    );
    let harness = Harness::with(
        Config::default(),
        ScriptedRunner::recon(),
        lightweight,
        ScriptedProvider::deep(),
    );
    let request = WorkflowRequest::new(TARGET).with_task_types([TaskType::PortScan]);
    let outcome = harness.orchestrator.run(request).await.unwrap();

    assert_eq!(outcome.runs.len(), 2);
    assert_eq!(outcome.runs[1].drain_order, vec![TaskType::TlsInspection]);
    assert_eq!(outcome.runs[1].count("completed"), 3);
    assert_eq!(harness.runner.runs_of(TaskType::SubdomainDiscovery).len(), 1);
    assert_eq!(
        harness.runner.runs_of(TaskType::TlsInspection)[0].params["targets"],
        json!(["www.example.com:443"])
    );
    assert_eq!(outcome.report.count(Category::Certificate), 1);
    assert_eq!(outcome.decisions_of(DecisionKind::NextSteps).count(), 2);
}

/// Test: Decision rounds are bounded
#[tokio::test]
async fn test_e2e_decision_rounds_bounded() {
    let mut lightweight = ScriptedProvider::lightweight();
    for _ in 0..5 {
        lightweight = lightweight.answer(
            DecisionKind::NextSteps,
            Decision::RunTasks {
                task_types: vec![TaskType::DnsResolution],
                reasoning: "again".to_string(),
            },
        );
    }
    let mut config = Config::default();
    config.budget.max_decision_rounds = 3;
    let harness = Harness::with(config, ScriptedRunner::recon(), lightweight, ScriptedProvider::deep());
    let request = WorkflowRequest::new(TARGET).with_task_types([TaskType::DnsResolution]);
    let outcome = harness.orchestrator.run(request).await.unwrap();

    assert_eq!(outcome.runs.len(), 4);
    assert_eq!(outcome.decisions_of(DecisionKind::NextSteps).count(), 3);
    assert_eq!(harness.runner.runs_of(TaskType::DnsResolution).len(), 4);
}

/// Test: Triage for low-severity findings
#[tokio::test]
async fn test_e2e_low_severity_triaged() {
    let runner = ScriptedRunner::recon().script(
        TaskType::VulnerabilityScan,
        Script::Findings(vec![crate::fixtures::vulnerability(
            "server-header",
            "https://www.example.com",
            "www.example.com",
            "low",
        )]),
    );
    let harness = Harness::new(runner);
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert!(outcome.decisions_of(DecisionKind::Escalation).next().is_none());
    let triage = outcome.decisions_of(DecisionKind::Triage).next().unwrap();
    assert_eq!(triage.answered_by, Some(Tier::Lightweight));
}

/// Test: Final report falls back to the aggregate summary
#[tokio::test(start_paused = true)]
async fn test_e2e_final_report_fallback() {
    let harness = Harness::with(
        Config::default(),
        ScriptedRunner::recon(),
        ScriptedProvider::lightweight().failing(u32::MAX, Default::default()),
        ScriptedProvider::deep().failing(u32::MAX, Default::default()),
    );
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert!(outcome.decisions.iter().all(|d| d.fallback_used));
    assert_eq!(outcome.summary, outcome.report.summary());
    assert!(outcome.summary.starts_with("14 findings"));
}

/// Test: Cancellation mid-workflow
/// Given port scanning hangs
/// When the workflow token fires
/// Then waiting tasks are cancelled and the workflow ends Cancelled
#[tokio::test(start_paused = true)]
async fn test_e2e_cancellation() {
    let runner = ScriptedRunner::recon().script(TaskType::PortScan, Script::Hang);
    let harness = Harness::new(runner);
    let cancel = harness.orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Cancelled);
    let run = &outcome.runs[0];
    assert_eq!(run.count("cancelled"), 6);
    assert_eq!(run.count("completed"), 2);
    assert!(!harness.runner.started_order().contains(&TaskType::HttpProbe));
    assert!(outcome.decisions_of(DecisionKind::NextSteps).next().is_none());
    assert_eq!(harness.deep.call_count(), 0);

    let events = harness
        .orchestrator
        .event_log()
        .read_after(outcome.workflow_id, 0)
        .await
        .unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowCancelled);
}

/// Test: Invalid target is rejected before anything runs
#[tokio::test]
async fn test_e2e_invalid_target() {
    let harness = Harness::new(ScriptedRunner::recon());
    assert!(harness
        .orchestrator
        .run(WorkflowRequest::new("exa mple.com"))
        .await
        .is_err());
    assert!(harness.runner.records().is_empty());
}

/// Test: Lost events surface as a warning, not a failure
#[tokio::test(start_paused = true)]
async fn test_e2e_stream_gap_warning() {
    let log = Arc::new(FlakyEventLog::rejecting([EventType::PlanComputed]));
    let harness = Harness::new(ScriptedRunner::recon()).map(|o| o.with_event_log(log.clone()));
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.warnings, vec![WorkflowWarning::StreamGap { dropped: 1 }]);

    // The remaining events still number contiguously.
    let events = log.read_after(outcome.workflow_id, 0).await.unwrap();
    assert_contiguous(&events, 1);
    assert!(events.iter().all(|e| e.event_type != EventType::PlanComputed));
}

/// Test: Transient append failures are retried without a gap
#[tokio::test(start_paused = true)]
async fn test_e2e_transient_append_failures_retried() {
    let log = Arc::new(FlakyEventLog::transient(2));
    let harness = Harness::new(ScriptedRunner::recon()).map(|o| o.with_event_log(log.clone()));
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert!(outcome.warnings.is_empty());
    let events = log.read_after(outcome.workflow_id, 0).await.unwrap();
    assert_eq!(events[0].event_type, EventType::WorkflowStarted);
}

/// Test: Persisted workflow
/// Given a SQLite database
/// When a workflow completes
/// Then workflow, task, finding and event rows are all written
#[tokio::test]
async fn test_e2e_persists_to_database() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Database::open(&temp_dir.path().join("reconflow.db")).unwrap();
    let harness = Harness::new(ScriptedRunner::recon()).map(|o| o.with_database(db.clone()));
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    assert_eq!(
        db.workflow_status(outcome.workflow_id).unwrap(),
        Some(WorkflowStatus::Completed)
    );
    let tasks = db.load_tasks(outcome.workflow_id).unwrap();
    assert_eq!(tasks.len(), TaskType::ALL.len());
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(db.load_findings(Category::Host).unwrap().len(), 2);

    let events = db.read_after(outcome.workflow_id, 0).await.unwrap();
    assert_contiguous(&events, 1);
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowCompleted);
}

/// Test: Failure after start
/// Given parameters that the scheduler rejects
/// When the workflow is run against a database
/// Then the error is returned, WorkflowFailed is the last event and the
/// workflow row is marked failed
#[tokio::test]
async fn test_e2e_submit_error_fails_workflow() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Database::open(&temp_dir.path().join("reconflow.db")).unwrap();
    let harness = Harness::new(ScriptedRunner::recon()).map(|o| o.with_database(db.clone()));
    let workflow_id = WorkflowId::new();
    let request =
        WorkflowRequest::new(TARGET).with_params(TaskType::SubdomainDiscovery, json!("oops"));

    let err = harness
        .orchestrator
        .run_with_id(workflow_id, request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(harness.runner.records().is_empty());

    let events = db.read_after(workflow_id, 0).await.unwrap();
    assert_contiguous(&events, 1);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::WorkflowFailed);
    assert_eq!(last.payload["status"], json!("failed"));
    assert!(last.payload["error"].as_str().unwrap().contains("JSON object"));
    assert_eq!(db.workflow_status(workflow_id).unwrap(), Some(WorkflowStatus::Failed));

    // Consumers see the failure and stop.
    let items: Vec<_> = harness
        .orchestrator
        .stream(workflow_id, 0)
        .into_stream()
        .collect()
        .await;
    assert_eq!(items.len(), events.len());
}

/// Test: Findings dedup
/// Adding the same (category, key) twice keeps one entry with the later value.
#[test]
fn test_findings_dedup_keeps_latest_value() {
    let context = SharedContext::new();
    let producer = TaskId::new();
    context.put(Category::Host, "h1", json!({ "v": 1 }), producer);
    context.put(Category::Host, "h1", json!({ "v": 2 }), producer);

    let hosts = context.query(Category::Host);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].value, json!({ "v": 2 }));
}

/// Test: Aggregation idempotence
/// Aggregating an unmodified context twice yields byte-identical reports.
#[tokio::test]
async fn test_aggregation_idempotent_after_workflow() {
    let harness = Harness::new(ScriptedRunner::recon());
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();

    let context = SharedContext::new();
    let producer = TaskId::new();
    for (category, summary) in &outcome.report.categories {
        for key in &summary.preview {
            context.put(*category, key, json!({ "host": "www.example.com" }), producer);
        }
    }
    let aggregator = ResultAggregator::default();
    let first = aggregator.aggregate(&context).to_json().unwrap();
    let second = aggregator.aggregate(&context).to_json().unwrap();
    assert_eq!(first, second);
}
