//! Lifecycle events
//!
//! The engine reports every status transition and the service start/stop
//! through a single `notify` call. Publication is best-effort: a failed
//! notify is recorded on the resource but never fails the download.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Buffered events before slow subscribers start losing them
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Service,
    Download,
}

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Status name or service action, e.g. `running`, `started`
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Event {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Service,
            name: name.into(),
            id: None,
        }
    }

    pub fn download(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Download,
            name: name.into(),
            id: Some(id.into()),
        }
    }
}

/// Outbound event sink
///
/// Implementations adapt status transitions to whatever transport carries
/// them; loss of events is tolerated by the engine.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: Event) -> Result<()>;
}

/// In-process fan-out sink backed by a broadcast channel.
///
/// Subscribers receive every event published while they are attached; the
/// external producer adapter and the metrics updater both hang off this.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn notify(&self, event: Event) -> Result<()> {
        tracing::debug!(kind = ?event.kind, name = %event.name, id = ?event.id, "event");
        // no subscribers is not a failure
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Sink that only logs; used when outbound events are disabled
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&self, event: Event) -> Result<()> {
        tracing::info!(kind = ?event.kind, name = %event.name, id = ?event.id, "event");
        Ok(())
    }
}
