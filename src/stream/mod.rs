//! Durable, resumable progress stream.
//!
//! Events are appended through an [`EventPublisher`] into an [`EventLog`]
//! and read back by [`EventStream`] consumers that can resume from any
//! previously seen sequence. A [`StatusSource`] lets consumers stop once
//! the workflow has ended even if its terminal event was lost.

mod consumer;
mod event;
mod log;
mod publisher;
mod status;

pub use consumer::{EventStream, StreamItem};
pub use event::{EventType, StreamEvent};
pub use log::{EventLog, MemoryEventLog};
pub use publisher::EventPublisher;
pub use status::{StatusBoard, StatusSource};
