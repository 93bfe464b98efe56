//! Error types for Cleaner Dispatch.

use uuid::Uuid;

use crate::jobs::model::JobStatus;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),
}

impl DatabaseError {
    /// Classify a libSQL error raised by a write, surfacing UNIQUE/CHECK
    /// violations as [`DatabaseError::Constraint`].
    pub fn from_write(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") || text.contains("CHECK constraint failed") {
            Self::Constraint(format!("{context}: {text}"))
        } else {
            Self::Query(format!("{context}: {text}"))
        }
    }
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors raised by dispatch and job lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Cleaner {id} not found")]
    CleanerNotFound { id: Uuid },

    #[error("Job {id} is {status}, cannot {operation}")]
    InvalidJobState {
        id: Uuid,
        status: JobStatus,
        operation: String,
    },

    #[error("Job {job_id} is not assigned to cleaner {cleaner_id}")]
    NotAssigned { job_id: Uuid, cleaner_id: Uuid },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Offer could not be delivered: {0}")]
    Channel(#[from] ChannelError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
