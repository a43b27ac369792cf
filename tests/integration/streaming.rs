//! Event log and stream consumer integration tests.
//!
//! These tests verify per-workflow sequence monotonicity under
//! concurrent writers, and that a consumer can follow a live workflow,
//! disconnect, and resume without gaps or duplicates.

use futures::StreamExt;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reconflow::core::TaskType;
use reconflow::storage::Database;
use reconflow::stream::{
    EventLog, EventStream, EventType, MemoryEventLog, StreamEvent, StreamItem,
};
use reconflow::{WorkflowId, WorkflowRequest, WorkflowStatus};

use crate::fixtures::{assert_contiguous, FlakyEventLog, Harness, ScriptedRunner, TARGET};

fn events_of(items: Vec<reconflow::Result<StreamItem>>) -> Vec<StreamEvent> {
    items
        .into_iter()
        .filter_map(|item| match item.unwrap() {
            StreamItem::Event(event) => Some(event),
            StreamItem::Heartbeat { .. } => None,
        })
        .collect()
}

/// Test: Sequence monotonicity
/// For events E1..E5, reading after 0 returns all five in order and
/// reading after 3 returns exactly E4 and E5.
#[tokio::test]
async fn test_read_after_returns_suffix() {
    let log = MemoryEventLog::new();
    let workflow_id = WorkflowId::new();
    for n in 1..=5 {
        log.append(workflow_id, EventType::TaskSubmitted, json!({ "n": n }))
            .await
            .unwrap();
    }

    let all = log.read_after(workflow_id, 0).await.unwrap();
    assert_eq!(all.len(), 5);
    assert_contiguous(&all, 1);
    for (i, event) in all.iter().enumerate() {
        assert_eq!(event.payload["n"], json!(i + 1));
    }

    let tail = log.read_after(workflow_id, 3).await.unwrap();
    let sequences: Vec<u64> = tail.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![4, 5]);
    assert!(log.read_after(workflow_id, 5).await.unwrap().is_empty());
}

async fn hammer(log: Arc<dyn EventLog>, workflows: &[WorkflowId], writers: usize, per_writer: usize) {
    let mut handles = Vec::new();
    for writer in 0..writers {
        let log = log.clone();
        let workflow_id = workflows[writer % workflows.len()];
        handles.push(tokio::spawn(async move {
            for n in 0..per_writer {
                log.append(
                    workflow_id,
                    EventType::TaskCompleted,
                    json!({ "writer": writer, "n": n }),
                )
                .await
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Test: Concurrent writers never skip or repeat a sequence (memory log)
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_memory() {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
    let workflows = [WorkflowId::new(), WorkflowId::new()];
    hammer(log.clone(), &workflows, 8, 50).await;

    for workflow_id in workflows {
        let events = log.read_after(workflow_id, 0).await.unwrap();
        assert_eq!(events.len(), 200);
        assert_contiguous(&events, 1);
    }
}

/// Test: Concurrent writers never skip or repeat a sequence (SQLite)
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_database() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Database::open(&temp_dir.path().join("events.db")).unwrap();
    let log: Arc<dyn EventLog> = Arc::new(db);
    let workflow_id = WorkflowId::new();
    hammer(log.clone(), &[workflow_id], 6, 20).await;

    let events = log.read_after(workflow_id, 0).await.unwrap();
    assert_eq!(events.len(), 120);
    assert_contiguous(&events, 1);

    let unique: BTreeSet<(u64, u64)> = events
        .iter()
        .map(|e| {
            (
                e.payload["writer"].as_u64().unwrap(),
                e.payload["n"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(unique.len(), 120);
}

/// Test: Resume from a seen sequence after the workflow finished
#[tokio::test(start_paused = true)]
async fn test_resume_after_completion() {
    let harness = Harness::new(ScriptedRunner::recon());
    let outcome = harness
        .orchestrator
        .run(WorkflowRequest::new(TARGET))
        .await
        .unwrap();
    let log = harness.orchestrator.event_log();
    let full = log.read_after(outcome.workflow_id, 0).await.unwrap();

    let items: Vec<_> = EventStream::new(log.clone(), outcome.workflow_id, 3)
        .into_stream()
        .collect()
        .await;
    let resumed = events_of(items);
    assert_eq!(resumed, full[3..].to_vec());
    assert_eq!(resumed[0].sequence, 4);
    assert!(resumed.last().unwrap().is_terminal());
}

/// Test: Follow a live workflow to its terminal event
#[tokio::test(start_paused = true)]
async fn test_follow_live_workflow() {
    let harness = Harness::new(ScriptedRunner::recon());
    let log = harness.orchestrator.event_log();
    let workflow_id = WorkflowId::new();

    let stream = EventStream::new(log.clone(), workflow_id, 0).into_stream();
    let (outcome, items) = tokio::join!(
        harness
            .orchestrator
            .run_with_id(workflow_id, WorkflowRequest::new(TARGET)),
        stream.collect::<Vec<_>>()
    );
    let outcome = outcome.unwrap();
    assert_eq!(outcome.workflow_id, workflow_id);
    assert_eq!(outcome.status, WorkflowStatus::Completed);

    let followed = events_of(items);
    assert_eq!(followed, log.read_after(workflow_id, 0).await.unwrap());
    assert_contiguous(&followed, 1);
    assert_eq!(
        followed.last().unwrap().event_type,
        EventType::WorkflowCompleted
    );
}

/// Test: Disconnect and reconnect
/// Given a consumer that drops its connection at the first heartbeat
/// When it reconnects from the heartbeat's cursor
/// Then it receives the rest of the workflow with no gaps or duplicates
#[tokio::test(start_paused = true)]
async fn test_reconnect_from_heartbeat_cursor() {
    let runner = ScriptedRunner::recon().delay(TaskType::PortScan, Duration::from_secs(40));
    let harness = Harness::new(runner);
    let log = harness.orchestrator.event_log();
    let workflow_id = WorkflowId::new();

    let first_connection = async {
        let mut stream = EventStream::new(log.clone(), workflow_id, 0);
        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                StreamItem::Event(event) => seen.push(event),
                StreamItem::Heartbeat { after_sequence } => return (seen, after_sequence),
            }
        }
        panic!("stream ended before any heartbeat");
    };
    let (outcome, (seen, cursor)) = tokio::join!(
        harness
            .orchestrator
            .run_with_id(workflow_id, WorkflowRequest::new(TARGET)),
        first_connection
    );
    outcome.unwrap();
    assert!(!seen.is_empty());
    assert_eq!(cursor, seen.last().unwrap().sequence);

    let items: Vec<_> = EventStream::new(log.clone(), workflow_id, cursor)
        .into_stream()
        .collect()
        .await;
    let mut combined = seen;
    combined.extend(events_of(items));
    assert_eq!(combined, log.read_after(workflow_id, 0).await.unwrap());
    assert_contiguous(&combined, 1);
}

/// Test: Lost terminal event
/// Given a log that rejects the completion event
/// When a consumer follows the workflow through the orchestrator
/// Then the stream still ends once the workflow is recorded as completed
#[tokio::test(start_paused = true)]
async fn test_stream_ends_when_terminal_event_is_lost() {
    let log = Arc::new(FlakyEventLog::rejecting([EventType::WorkflowCompleted]));
    let harness = Harness::new(ScriptedRunner::recon()).map(|o| o.with_event_log(log.clone()));
    let workflow_id = WorkflowId::new();

    let stream = harness.orchestrator.stream(workflow_id, 0).into_stream();
    let (outcome, items) = tokio::join!(
        harness
            .orchestrator
            .run_with_id(workflow_id, WorkflowRequest::new(TARGET)),
        stream.collect::<Vec<_>>()
    );
    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);

    let followed = events_of(items);
    assert_eq!(followed, log.read_after(workflow_id, 0).await.unwrap());
    assert!(followed.iter().all(|e| !e.is_terminal()));

    // A late consumer ends as well instead of heartbeating forever.
    let late: Vec<_> = harness
        .orchestrator
        .stream(workflow_id, 0)
        .into_stream()
        .collect()
        .await;
    assert!(late
        .iter()
        .all(|item| matches!(item, Ok(StreamItem::Event(_)))));
    assert_eq!(events_of(late), followed);
}
