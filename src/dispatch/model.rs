//! Job and job-item model with their state machines.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of bulk job. Only one exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BulkSend,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkSend => "bulk_send",
        }
    }
}

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, no item claimed yet.
    Queued,
    /// At least one item has been claimed.
    Processing,
    /// Every item finalized (individual items may have failed).
    Completed,
    /// Job-level fatal error, e.g. the device session went away.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// State of a single recipient within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobItemStatus {
    Pending,
    /// Claimed by a worker; a send may be on the wire.
    InFlight,
    Sent,
    Failed,
    /// Never attempted because the job was cancelled.
    Cancelled,
}

impl JobItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job item status: {other}")),
        }
    }
}

/// Aggregate progress counters of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl JobProgress {
    /// Items not yet finalized as sent or failed (cancelled items count here).
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.completed + self.failed)
    }

    pub fn is_done(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// A bulk-send job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub device_id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    /// Message template, opaque to the dispatcher.
    pub payload: serde_json::Value,
    /// Set when the job failed as a whole.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job for the given device and recipient count.
    pub fn new(device_id: impl Into<String>, total: u32, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: JobKind::BulkSend,
            device_id: device_id.into(),
            status: JobStatus::Queued,
            progress: JobProgress {
                total,
                completed: 0,
                failed: 0,
            },
            payload,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One recipient's delivery within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    pub id: i64,
    pub job_id: Uuid,
    pub recipient: String,
    pub status: JobItemStatus,
    /// Transport message id, recorded once a send is acknowledged.
    pub message_id: Option<String>,
    /// Last error seen for this recipient.
    pub error: Option<String>,
    /// Number of times the item has been claimed.
    pub attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Terminal result of one delivery, as written back to the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Sent { message_id: String },
    Failed { error: String },
}

impl Outcome {
    pub fn status(&self) -> JobItemStatus {
        match self {
            Self::Sent { .. } => JobItemStatus::Sent,
            Self::Failed { .. } => JobItemStatus::Failed,
        }
    }
}
