//! Error types for Courier.

use std::time::Duration;

use uuid::Uuid;

use crate::dispatch::model::JobStatus;

/// Top-level error type for the dispatch and automation core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed input, rejected synchronously before anything is queued or saved.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Recipient list is empty")]
    EmptyRecipients,

    #[error("Invalid recipient at index {index}: {recipient:?}")]
    InvalidRecipient { index: usize, recipient: String },

    #[error("Device id must not be empty")]
    EmptyDevice,

    #[error("Invalid regex trigger for rule {name:?}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Errors returned by the outbound transport for a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network failure, gateway 5xx and similar: worth another attempt.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    #[error("Rate limited by transport, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or blocked recipient: retrying cannot help.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// The device session is gone; every remaining item of the job is doomed.
    #[error("Device session lost: {0}")]
    SessionLost(String),
}

impl DeliveryError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// Whether the failure is fatal for the whole job, not just one recipient.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is still {status} and cannot be deleted")]
    StillActive { id: Uuid, status: JobStatus },

    #[error("Dispatcher is running; drain devices only while it is stopped")]
    DispatcherRunning,
}

/// Result type alias for Courier.
pub type Result<T> = std::result::Result<T, Error>;
