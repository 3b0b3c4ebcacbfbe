//! Fire-and-forget event notifications
//!
//! The director and the worker announce what they did; whoever renders the
//! board subscribes. Delivery is best-effort: a missing or lagging
//! subscriber never affects the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{CandidateId, SelectionReason, TaskId, TaskType};

// ============================================================================
// Events
// ============================================================================

/// Candidate summary carried by rotation events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRef {
    pub id: CandidateId,
    pub title: String,
    pub url: String,
}

/// Events published by the core loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new candidate went on stage
    Rotation {
        new_candidate: CandidateRef,
        reason: SelectionReason,
        started_at: DateTime<Utc>,
        rotation_ends_at: DateTime<Utc>,
    },

    /// The worker finished (or gave up on) a task
    TaskFinished {
        task_id: TaskId,
        candidate_id: CandidateId,
        task_type: TaskType,
        success: bool,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rotation { .. } => "rotation",
            Self::TaskFinished { .. } => "task_finished",
        }
    }
}

// ============================================================================
// Broadcasters
// ============================================================================

/// Notification sink
pub trait EventBroadcaster: Send + Sync {
    /// Publish an event; never fails from the caller's point of view
    fn broadcast(&self, event: Event);
}

/// Broadcaster backed by a `tokio::sync::broadcast` channel
#[derive(Clone)]
pub struct ChannelBroadcaster {
    event_tx: broadcast::Sender<Event>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: Event) {
        let kind = event.kind();
        // An error only means nobody is listening right now
        if self.event_tx.send(event).is_err() {
            tracing::trace!(event = kind, "No subscribers for event");
        }
    }
}

/// Broadcaster that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcaster;

impl EventBroadcaster for NoopBroadcaster {
    fn broadcast(&self, _event: Event) {}
}
