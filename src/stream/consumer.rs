//! Resumable consumer side of the event stream.
//!
//! An [`EventStream`] reads a workflow's events with `sequence` greater
//! than a cursor, polling the log at an adaptive interval: it drops back to
//! the minimum interval while events keep arriving and doubles toward the
//! cap while idle. A live broadcast receiver, when attached, wakes the
//! poller early. Without items for a heartbeat interval the stream yields
//! a heartbeat. After the terminal workflow event has been delivered the
//! stream ends. With a [`StatusSource`] attached the stream also ends once
//! the log is drained and the workflow's recorded status is terminal, which
//! covers a terminal event the log never accepted.

use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::StreamConfig;
use crate::stream::event::StreamEvent;
use crate::stream::log::EventLog;
use crate::stream::status::StatusSource;
use crate::workflow::WorkflowId;
use crate::{rlog_debug, rlog_trace, Result};

/// Item delivered to a stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(StreamEvent),
    /// Nothing new; `after_sequence` is the cursor to resume from.
    Heartbeat { after_sequence: u64 },
}

pub struct EventStream {
    log: Arc<dyn EventLog>,
    workflow_id: WorkflowId,
    cursor: u64,
    heartbeat: Duration,
    min_poll: Duration,
    max_poll: Duration,
    interval: Duration,
    notifications: Option<broadcast::Receiver<StreamEvent>>,
    status: Option<Arc<dyn StatusSource>>,
    buffer: VecDeque<StreamEvent>,
    last_item: Instant,
    finished: bool,
}

impl EventStream {
    /// Stream events after `after_sequence` (0 reads from the start).
    pub fn new(log: Arc<dyn EventLog>, workflow_id: WorkflowId, after_sequence: u64) -> Self {
        let config = StreamConfig::default();
        Self {
            log,
            workflow_id,
            cursor: after_sequence,
            heartbeat: config.heartbeat(),
            min_poll: config.min_poll(),
            max_poll: config.max_poll(),
            interval: config.min_poll(),
            notifications: None,
            status: None,
            buffer: VecDeque::new(),
            last_item: Instant::now(),
            finished: false,
        }
    }

    pub fn with_config(mut self, config: &StreamConfig) -> Self {
        self.heartbeat = config.heartbeat();
        self.min_poll = config.min_poll();
        self.max_poll = config.max_poll();
        self.interval = self.min_poll;
        self
    }

    /// Wake on live notifications instead of waiting out the poll interval.
    pub fn with_notifications(mut self, receiver: broadcast::Receiver<StreamEvent>) -> Self {
        self.notifications = Some(receiver);
        self
    }

    /// End the stream once `source` reports a terminal status and the log
    /// has nothing left after the cursor.
    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status = Some(source);
        self
    }

    /// Sequence of the last delivered event.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Current poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    /// Next item, or `None` once the workflow's terminal event was delivered
    /// or the status source reports the workflow ended.
    ///
    /// A read error is returned as an item; the stream stays usable and the
    /// next call retries from the same cursor.
    pub async fn next(&mut self) -> Option<Result<StreamItem>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.cursor = event.sequence;
                self.last_item = Instant::now();
                if event.is_terminal() {
                    self.finished = true;
                    self.buffer.clear();
                }
                return Some(Ok(StreamItem::Event(event)));
            }
            if self.finished {
                return None;
            }

            let events = match self.log.read_after(self.workflow_id, self.cursor).await {
                Ok(events) => events,
                Err(e) => return Some(Err(e)),
            };
            if !events.is_empty() {
                self.interval = self.min_poll;
                // Guard against a log returning already-seen sequences.
                let cursor = self.cursor;
                self.buffer
                    .extend(events.into_iter().filter(|e| e.sequence > cursor));
                continue;
            }

            if self.workflow_ended().await {
                // Events appended just before the status flipped.
                let events = match self.log.read_after(self.workflow_id, self.cursor).await {
                    Ok(events) => events,
                    Err(e) => return Some(Err(e)),
                };
                let cursor = self.cursor;
                self.buffer
                    .extend(events.into_iter().filter(|e| e.sequence > cursor));
                if self.buffer.is_empty() {
                    rlog_debug!(
                        "[{}] workflow ended without a terminal event after {}",
                        self.workflow_id.short(),
                        self.cursor
                    );
                    self.finished = true;
                    return None;
                }
                continue;
            }

            let idle = self.last_item.elapsed();
            if idle >= self.heartbeat {
                self.last_item = Instant::now();
                return Some(Ok(StreamItem::Heartbeat {
                    after_sequence: self.cursor,
                }));
            }

            let wait = self.interval.min(self.heartbeat - idle);
            if self.wait(wait).await {
                self.interval = self.min_poll;
            } else {
                self.interval = (self.interval * 2).min(self.max_poll);
                rlog_trace!(
                    "[{}] stream idle, poll interval {:?}",
                    self.workflow_id.short(),
                    self.interval
                );
            }
        }
    }

    /// Whether the status source reports a terminal status. Lookup errors
    /// count as still running.
    async fn workflow_ended(&self) -> bool {
        let Some(source) = self.status.as_ref() else {
            return false;
        };
        match source.workflow_status(self.workflow_id).await {
            Ok(status) => status.is_some_and(|s| s.is_terminal()),
            Err(e) => {
                rlog_debug!("[{}] status lookup failed: {}", self.workflow_id.short(), e);
                false
            }
        }
    }

    /// Sleep for `duration` or until a notification arrives.
    ///
    /// Returns whether a notification cut the wait short.
    async fn wait(&mut self, duration: Duration) -> bool {
        let Some(receiver) = self.notifications.as_mut() else {
            tokio::time::sleep(duration).await;
            return false;
        };
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => true,
                Err(broadcast::error::RecvError::Closed) => {
                    self.notifications = None;
                    false
                }
            },
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(mut self) -> impl Stream<Item = Result<StreamItem>> + Send {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("workflow_id", &self.workflow_id)
            .field("cursor", &self.cursor)
            .field("interval", &self.interval)
            .field("finished", &self.finished)
            .finish()
    }
}
