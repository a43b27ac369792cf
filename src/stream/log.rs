//! Append-only event log.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::stream::event::{EventType, StreamEvent};
use crate::workflow::WorkflowId;
use crate::Result;

/// Durable, per-workflow ordered event storage.
///
/// `append` assigns the next sequence for the workflow atomically, so
/// concurrent writers never share or skip a sequence.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return it with its assigned sequence.
    async fn append(
        &self,
        workflow_id: WorkflowId,
        event_type: EventType,
        payload: Value,
    ) -> Result<StreamEvent>;

    /// Events with `sequence > after`, in order.
    async fn read_after(&self, workflow_id: WorkflowId, after: u64) -> Result<Vec<StreamEvent>>;
}

/// In-process event log used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    workflows: Mutex<HashMap<WorkflowId, Vec<StreamEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, workflow_id: WorkflowId) -> usize {
        self.workflows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&workflow_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(
        &self,
        workflow_id: WorkflowId,
        event_type: EventType,
        payload: Value,
    ) -> Result<StreamEvent> {
        let mut workflows = self.workflows.lock().unwrap_or_else(PoisonError::into_inner);
        let events = workflows.entry(workflow_id).or_default();
        let event = StreamEvent {
            workflow_id,
            sequence: events.len() as u64 + 1,
            event_type,
            payload,
            timestamp: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn read_after(&self, workflow_id: WorkflowId, after: u64) -> Result<Vec<StreamEvent>> {
        let workflows = self.workflows.lock().unwrap_or_else(PoisonError::into_inner);
        // Sequences are 1-based and dense, so `after` is also the index of
        // the first event to return.
        Ok(workflows
            .get(&workflow_id)
            .map(|events| {
                let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
                events[start..].to_vec()
            })
            .unwrap_or_default())
    }
}
