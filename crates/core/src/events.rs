//! Recording lifecycle events.
//!
//! Publishing is fire-and-forget: a publisher must not block the
//! connection thread and has no way to fail the session.

use std::time::SystemTime;

use parking_lot::Mutex;

use crate::session::{RecordingMetadata, SessionIds};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    /// Metadata of a new recording is known.
    Added(RecordingMetadata),
    /// Duration and size of a recording changed.
    ValueChanged {
        ids: SessionIds,
        duration_secs: f64,
        size: u64,
        completed: bool,
        purge_at: Option<SystemTime>,
    },
}

impl RecordingEvent {
    pub fn recording_id(&self) -> uuid::Uuid {
        match self {
            RecordingEvent::Added(metadata) => metadata.ids.recording_id,
            RecordingEvent::ValueChanged { ids, .. } => ids.recording_id,
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: RecordingEvent);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: RecordingEvent) {
        match &event {
            RecordingEvent::Added(metadata) => tracing::info!(
                recording_id = %metadata.ids.recording_id,
                place_id = %metadata.ids.place_id,
                kind = metadata.kind.as_str(),
                "recording added"
            ),
            RecordingEvent::ValueChanged {
                ids,
                duration_secs,
                size,
                completed,
                purge_at,
            } => tracing::info!(
                recording_id = %ids.recording_id,
                place_id = %ids.place_id,
                duration_secs,
                size,
                completed,
                purge_at = ?purge_at,
                "recording value changed"
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<RecordingEvent>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordingEvent> {
        self.events.lock().clone()
    }

    pub fn added(&self) -> Vec<RecordingMetadata> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RecordingEvent::Added(metadata) => Some(metadata.clone()),
                RecordingEvent::ValueChanged { .. } => None,
            })
            .collect()
    }

    pub fn value_changed(&self) -> Vec<RecordingEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, RecordingEvent::ValueChanged { .. }))
            .cloned()
            .collect()
    }
}

impl EventPublisher for MemoryPublisher {
    fn publish(&self, event: RecordingEvent) {
        tracing::trace!(recording_id = %event.recording_id(), "event collected");
        self.events.lock().push(event);
    }
}
