use thiserror::Error;

use crate::core::client::command::CommandError;
use crate::core::client::database::DatabaseError;
use crate::pipeline::error::PipelineError;
use crate::types::jobs::types::{JobId, JobState};

pub type JobResult<T> = Result<T, JobError>;

/// Errors raised while driving one claimed job. All of them end the job in `failed`.
#[derive(Error, Debug)]
pub enum JobError {
    /// The stored config payload does not decode into a known pipeline, or fails validation
    #[error("Invalid config for job {id}: {reason}")]
    InvalidConfig { id: JobId, reason: String },

    /// The job is in a state that does not allow the requested operation
    #[error("Invalid state {state} for job {id}. Cannot process.")]
    InvalidState { id: JobId, state: JobState },

    /// The job's process exited unsuccessfully
    #[error("Process of job {id} exited with code {exit_code:?}")]
    ProcessFailed { id: JobId, exit_code: Option<i32> },

    #[error("Job {id} was cancelled")]
    Cancelled { id: JobId },

    #[error("Job {id} timed out after {timeout_secs}s")]
    TimedOut { id: JobId, timeout_secs: u64 },

    #[error("Log forwarding for job {id} stopped: {reason}")]
    LogForwarding { id: JobId, reason: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Command error: {0}")]
    CommandError(#[from] CommandError),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),

    #[error("Failed to serialize data: {0}")]
    FailedToSerializeData(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
