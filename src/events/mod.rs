//! Event fan-out: best-effort publication of job and conversation transitions.
//!
//! Backed by a bounded `tokio::sync::broadcast` ring. Publishing never blocks
//! and never fails: with no subscribers the event is simply dropped, and a
//! subscriber that falls behind loses the oldest events (it observes
//! `RecvError::Lagged(n)` on its next receive).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::dispatch::model::JobProgress;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A state transition observable by subscribers (e.g. the UI live stream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobProgress {
        job_id: Uuid,
        device_id: String,
        progress: JobProgress,
    },
    JobCompleted {
        job_id: Uuid,
        device_id: String,
        progress: JobProgress,
    },
    JobCancelled {
        job_id: Uuid,
        device_id: String,
        progress: JobProgress,
    },
    JobFailed {
        job_id: Uuid,
        device_id: String,
        progress: JobProgress,
        error: String,
    },
    HandoffStarted {
        device_id: String,
        counterpart_id: String,
        reason: Option<String>,
    },
    BotResumed {
        device_id: String,
        counterpart_id: String,
    },
    AutoReplySent {
        device_id: String,
        counterpart_id: String,
        rule_id: i64,
        message_id: String,
    },
}

impl Event {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobProgress { .. } => "job_progress",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::JobFailed { .. } => "job_failed",
            Self::HandoffStarted { .. } => "handoff_started",
            Self::BotResumed { .. } => "bot_resumed",
            Self::AutoReplySent { .. } => "auto_reply_sent",
        }
    }
}

/// Cloneable handle to the fan-out ring.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus holding at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns how many subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        // Err only means nobody is listening
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(kind, subscribers = delivered, "Event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
