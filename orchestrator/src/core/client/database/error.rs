use thiserror::Error;

use crate::types::jobs::types::{JobId, JobState};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Postgres error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Failed to find job with id {0}")]
    JobNotFound(JobId),

    /// The caller believed it owned a running job, but the row was moved out of `running`
    /// by someone else in the meantime.
    #[error("Job {id} is no longer owned by this worker (found in state {found})")]
    ClaimRace { id: JobId, found: JobState },

    #[error("Invalid state {state} for job {id}: {reason}")]
    InvalidState { id: JobId, state: String, reason: String },

    #[error("Invalid job config: {0}")]
    InvalidConfig(String),

    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Failed to serialize document: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Database connection is closed")]
    Disconnected,
}
