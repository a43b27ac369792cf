//! Publishing side of the event stream.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::StreamConfig;
use crate::stream::event::{EventType, StreamEvent};
use crate::stream::log::EventLog;
use crate::workflow::WorkflowId;
use crate::{rlog_debug, rlog_error, rlog_warn};

const BROADCAST_CAPACITY: usize = 256;

/// Appends a workflow's events to the log and fans them out to live
/// subscribers.
///
/// Appends are retried with exponential backoff. An event that still
/// cannot be written is dropped and counted as a gap; the workflow keeps
/// running.
pub struct EventPublisher {
    workflow_id: WorkflowId,
    log: Arc<dyn EventLog>,
    sender: broadcast::Sender<StreamEvent>,
    attempts: u32,
    backoff: Duration,
    gaps: AtomicU64,
}

impl EventPublisher {
    pub fn new(workflow_id: WorkflowId, log: Arc<dyn EventLog>) -> Self {
        Self::with_config(workflow_id, log, &StreamConfig::default())
    }

    pub fn with_config(workflow_id: WorkflowId, log: Arc<dyn EventLog>, config: &StreamConfig) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            workflow_id,
            log,
            sender,
            attempts: config.append_attempts.max(1),
            backoff: config.append_backoff(),
            gaps: AtomicU64::new(0),
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }

    /// Live notifications for events appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Events that could not be persisted.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Append an event, retrying on failure.
    ///
    /// Returns `None` when every attempt failed.
    pub async fn publish(&self, event_type: EventType, payload: Value) -> Option<StreamEvent> {
        let mut delay = self.backoff;
        for attempt in 1..=self.attempts {
            match self
                .log
                .append(self.workflow_id, event_type, payload.clone())
                .await
            {
                Ok(event) => {
                    rlog_debug!(
                        "[{}] event #{} {}",
                        self.workflow_id.short(),
                        event.sequence,
                        event_type
                    );
                    // No receivers is not an error.
                    let _ = self.sender.send(event.clone());
                    return Some(event);
                }
                Err(e) if attempt < self.attempts => {
                    rlog_warn!(
                        "[{}] append {} failed (attempt {}/{}): {}",
                        self.workflow_id.short(),
                        event_type,
                        attempt,
                        self.attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    rlog_error!(
                        "[{}] dropping {} after {} attempts: {}",
                        self.workflow_id.short(),
                        event_type,
                        self.attempts,
                        e
                    );
                }
            }
        }
        self.gaps.fetch_add(1, Ordering::Relaxed);
        None
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("workflow_id", &self.workflow_id)
            .field("attempts", &self.attempts)
            .field("gaps", &self.gaps())
            .finish()
    }
}
