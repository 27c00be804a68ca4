use thiserror::Error;

use crate::artifact::error::ArtifactError;
use crate::core::client::command::CommandError;
use crate::core::client::database::DatabaseError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage {0} is declared more than once")]
    DuplicateStage(String),

    #[error("Stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Stage dependencies form a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// The stage's external action exited unsuccessfully. `output` holds the last lines it printed.
    #[error("Stage {stage} failed with exit code {exit_code:?}")]
    StageFailure { stage: String, exit_code: Option<i32>, output: Vec<String> },

    #[error("Stage {stage} was cancelled")]
    Cancelled { stage: String },

    #[error("Invalid partition id: {0:?}")]
    InvalidPartition(String),

    #[error("Stage {stage} has no input {input}")]
    MissingInput { stage: String, input: String },

    #[error("Invalid input for stage {stage}: {reason}")]
    InvalidInput { stage: String, reason: String },

    #[error("Artifact error: {0}")]
    ArtifactError(#[from] ArtifactError),

    #[error("Command error: {0}")]
    CommandError(#[from] CommandError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
