use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;

/// Startup and wiring failures in the server binary.
#[derive(Error, Debug)]
pub enum RecapError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Model gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors raised by a `SummaryStore` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("summary record not found: {0}")]
    NotFound(Uuid),

    #[error("summary record already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a `JobQueue` implementation.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
