pub mod job;

use thiserror::Error;

use crate::artifact::error::ArtifactError;
use crate::core::client::command::CommandError;
use crate::core::client::database::DatabaseError;
use crate::core::client::storage::StorageError;
use crate::error::job::JobError;
use crate::pipeline::error::PipelineError;

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Error types for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Command error: {0}")]
    CommandError(#[from] CommandError),

    #[error("Artifact error: {0}")]
    ArtifactError(#[from] ArtifactError),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),

    #[error("Job error: {0}")]
    JobError(#[from] JobError),

    /// Run Command error
    #[error("Run Command Error: {0}")]
    RunCommandError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
