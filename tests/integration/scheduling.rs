//! Scheduler integration tests.
//!
//! These tests verify dependency ordering, failure propagation, strategy
//! skips, timeouts and deterministic drain order against scripted runners.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use reconflow::config::SchedulerConfig;
use reconflow::core::{
    DependencyResolver, SharedContext, SkipReason, Target, Task, TaskId, TaskStatus, TaskType,
};
use reconflow::orchestration::{RunSummary, Scheduler};
use reconflow::stream::{EventLog, EventPublisher, EventType, MemoryEventLog};
use reconflow::WorkflowId;

use crate::fixtures::{port, Script, ScriptedRunner, TARGET};

const A: TaskType = TaskType::SubdomainDiscovery;
const B: TaskType = TaskType::DnsResolution;
const C: TaskType = TaskType::PortScan;

fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        ..SchedulerConfig::default()
    }
}

fn scheduler(runner: Arc<ScriptedRunner>, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(
        WorkflowId::new(),
        Target::parse(TARGET).unwrap(),
        SharedContext::new(),
        runner,
        config,
    )
}

/// A with B and C depending on it.
fn fan_out() -> Arc<DependencyResolver> {
    Arc::new(DependencyResolver::from_edges(&[A, B, C], &[(A, B), (A, C)]).unwrap())
}

fn status_of(tasks: &[Task], id: TaskId) -> TaskStatus {
    tasks.iter().find(|t| t.id == id).unwrap().status.clone()
}

/// Test: Dependency ordering
/// Given A, B (deps: A) and C (deps: A)
/// When the scheduler runs
/// Then waves are [{A}, {B, C}] and neither B nor C starts before A completes
#[tokio::test(start_paused = true)]
async fn test_dependency_ordering() {
    let runner = Arc::new(
        ScriptedRunner::recon()
            .delay(A, Duration::from_millis(50))
            .delay(B, Duration::from_millis(10))
            .delay(C, Duration::from_millis(10)),
    );
    let scheduler = scheduler(runner.clone(), config(4)).with_resolver(fan_out());
    scheduler.submit(C, None).await.unwrap();
    scheduler.submit(B, None).await.unwrap();
    scheduler.submit(A, None).await.unwrap();

    let summary = scheduler.start().await.unwrap();
    assert_eq!(
        summary.waves,
        vec![BTreeSet::from([A]), BTreeSet::from([B, C])]
    );
    assert_eq!(summary.count("completed"), 3);

    let records = runner.records();
    let a_finished = records.iter().find(|r| r.task_type == A).unwrap().finished.unwrap();
    for record in records.iter().filter(|r| r.task_type != A) {
        assert!(
            record.started >= a_finished,
            "{} started before {} completed",
            record.task_type,
            A
        );
    }
}

/// Test: Dependency-failure propagation
/// Given A fails
/// Then every task depending on A, directly or transitively, is skipped
/// with A's task id as the reason
#[tokio::test]
async fn test_failure_propagates_root_id() {
    let runner = Arc::new(
        ScriptedRunner::recon().script(A, Script::Fail("upstream error".to_string())),
    );
    let scheduler = scheduler(runner.clone(), config(4));
    let root = scheduler.submit(A, None).await.unwrap();
    let direct = scheduler.submit(C, None).await.unwrap();
    let transitive = scheduler.submit(TaskType::HttpProbe, None).await.unwrap();

    let summary = scheduler.start().await.unwrap();
    assert_eq!(summary.count("failed"), 1);
    assert_eq!(summary.count("skipped"), 2);
    assert_eq!(runner.started_order(), vec![A]);

    let tasks = scheduler.handle().snapshot().await;
    assert!(matches!(status_of(&tasks, root), TaskStatus::Failed { .. }));
    for id in [direct, transitive] {
        match status_of(&tasks, id) {
            TaskStatus::Skipped {
                reason: SkipReason::DependencyFailed { task_id, task_type },
            } => {
                assert_eq!(task_id, root);
                assert_eq!(task_type, A);
            }
            other => panic!("expected a dependency skip, got {}", other),
        }
    }
}

/// Test: Timeout propagates like failure
#[tokio::test(start_paused = true)]
async fn test_timeout_propagates() {
    let runner = Arc::new(ScriptedRunner::recon().script(C, Script::Hang));
    let mut config = config(4);
    config.timeouts.insert(C, 1);
    let scheduler = scheduler(runner, config);
    scheduler.submit(A, None).await.unwrap();
    let scan = scheduler.submit(C, None).await.unwrap();
    let http = scheduler.submit(TaskType::HttpProbe, None).await.unwrap();

    let summary = scheduler.start().await.unwrap();
    assert_eq!(summary.count("timed_out"), 1);

    let tasks = scheduler.handle().snapshot().await;
    assert!(matches!(status_of(&tasks, scan), TaskStatus::TimedOut { .. }));
    assert!(matches!(
        status_of(&tasks, http),
        TaskStatus::Skipped {
            reason: SkipReason::DependencyFailed { task_id, .. }
        } if task_id == scan
    ));
}

/// Test: Missing dependency type
/// A task whose dependency type was never submitted is skipped once the
/// scheduler is quiescent.
#[tokio::test]
async fn test_unscheduled_dependency_skips() {
    let runner = Arc::new(ScriptedRunner::recon());
    let scheduler = scheduler(runner.clone(), config(2));
    let http = scheduler.submit(TaskType::HttpProbe, None).await.unwrap();

    scheduler.start().await.unwrap();
    assert!(runner.records().is_empty());
    let tasks = scheduler.handle().snapshot().await;
    assert_eq!(
        status_of(&tasks, http),
        TaskStatus::Skipped {
            reason: SkipReason::DependencyUnavailable {
                task_type: TaskType::PortScan
            }
        }
    );
}

/// Test: Strategy skip
/// Given port scanning finds only SSH
/// Then HTTP checks are skipped for lack of input and never runs
#[tokio::test]
async fn test_strategy_skip_no_input() {
    let runner = Arc::new(
        ScriptedRunner::recon().script(C, Script::Findings(vec![port("www.example.com", 22, "ssh")])),
    );
    let scheduler = scheduler(runner.clone(), config(2));
    scheduler.submit(A, None).await.unwrap();
    scheduler.submit(C, None).await.unwrap();
    let http = scheduler.submit(TaskType::HttpProbe, None).await.unwrap();
    let tls = scheduler.submit(TaskType::TlsInspection, None).await.unwrap();

    let summary = scheduler.start().await.unwrap();
    assert_eq!(summary.count("completed"), 2);
    assert!(runner.runs_of(TaskType::HttpProbe).is_empty());

    let tasks = scheduler.handle().snapshot().await;
    for id in [http, tls] {
        assert!(matches!(
            status_of(&tasks, id),
            TaskStatus::Skipped {
                reason: SkipReason::NoInput { .. }
            }
        ));
    }
}

/// Test: Strategy-built parameters reach the runner
#[tokio::test]
async fn test_strategy_params_from_context() {
    let runner = Arc::new(ScriptedRunner::recon());
    let scheduler = scheduler(runner.clone(), config(4));
    for task_type in [A, C, TaskType::HttpProbe] {
        scheduler.submit(task_type, None).await.unwrap();
    }
    scheduler.start().await.unwrap();

    let http = &runner.runs_of(TaskType::HttpProbe)[0];
    assert_eq!(
        http.params["targets"],
        json!([
            "api.example.com:8080",
            "www.example.com:443",
            "www.example.com:80"
        ])
    );
    let tasks = scheduler.handle().snapshot().await;
    assert!(tasks[2].reasoning.as_deref().unwrap().contains("3 web-capable ports"));
}

/// Test: Priority override
/// With one worker, a configured priority decides the order inside a wave.
#[tokio::test]
async fn test_priority_override_changes_drain_order() {
    let run = |priorities: BTreeMap<TaskType, u8>| async move {
        let mut config = config(1);
        config.priorities = priorities;
        let scheduler =
            scheduler(Arc::new(ScriptedRunner::recon()), config).with_resolver(fan_out());
        for task_type in [A, B, C] {
            scheduler.submit(task_type, None).await.unwrap();
        }
        scheduler.start().await.unwrap().drain_order
    };

    assert_eq!(run(BTreeMap::new()).await, vec![A, C, B]);
    assert_eq!(run(BTreeMap::from([(B, 1)])).await, vec![A, B, C]);
}

/// Test: Scheduling determinism
/// Two runs over identical submissions produce the same waves and the
/// same Ready-queue drain order.
#[tokio::test(start_paused = true)]
async fn test_scheduling_determinism() {
    async fn run_once() -> RunSummary {
        let mut runner = ScriptedRunner::recon();
        for (i, task_type) in TaskType::ALL.into_iter().enumerate() {
            runner = runner.delay(task_type, Duration::from_millis(10 * (i as u64 + 1)));
        }
        let scheduler = scheduler(Arc::new(runner), config(2));
        for task_type in TaskType::ALL.into_iter().rev() {
            scheduler.submit(task_type, None).await.unwrap();
        }
        scheduler.start().await.unwrap()
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first.waves, second.waves);
    assert_eq!(first.drain_order, second.drain_order);
    assert_eq!(first.drain_order.len(), TaskType::ALL.len());
    assert_eq!(first.waves, DependencyResolver::new().waves().unwrap());
}

/// Test: Every task walks submitted → ready → started → completed in the stream
#[tokio::test]
async fn test_task_events_in_lifecycle_order() {
    let log = Arc::new(MemoryEventLog::new());
    let workflow_id = WorkflowId::new();
    let publisher = Arc::new(EventPublisher::new(workflow_id, log.clone()));
    let scheduler = Scheduler::new(
        workflow_id,
        Target::parse(TARGET).unwrap(),
        SharedContext::new(),
        Arc::new(ScriptedRunner::recon()),
        config(2),
    )
    .with_resolver(fan_out())
    .with_publisher(publisher);
    let ids = [
        scheduler.submit(A, None).await.unwrap(),
        scheduler.submit(B, None).await.unwrap(),
        scheduler.submit(C, None).await.unwrap(),
    ];
    scheduler.start().await.unwrap();

    let events = log.read_after(workflow_id, 0).await.unwrap();
    assert_eq!(events.len(), 12);
    for id in ids {
        let lifecycle: Vec<EventType> = events
            .iter()
            .filter(|e| e.payload["task_id"] == json!(id))
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                EventType::TaskSubmitted,
                EventType::TaskReady,
                EventType::TaskStarted,
                EventType::TaskCompleted
            ]
        );
    }
}

/// Test: Cancel from a handle while tasks run
#[tokio::test(start_paused = true)]
async fn test_handle_cancel_while_running() {
    let runner = Arc::new(ScriptedRunner::recon().script(A, Script::Hang));
    let scheduler = scheduler(runner, config(2)).with_resolver(fan_out());
    for task_type in [A, B, C] {
        scheduler.submit(task_type, None).await.unwrap();
    }
    let handle = scheduler.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });

    let summary = scheduler.start().await.unwrap();
    assert_eq!(summary.count("cancelled"), 3);
    assert!(scheduler.handle().is_cancelled());

    // Late submissions are cancelled on arrival.
    let late = scheduler.submit(B, None).await.unwrap();
    let tasks = scheduler.handle().snapshot().await;
    assert_eq!(status_of(&tasks, late), TaskStatus::Cancelled);
}
