pub mod constant;
pub mod error;
pub mod postgres;

use crate::types::jobs::config::JobConfig;
use crate::types::jobs::job_item::{Job, LogEntry};
use crate::types::jobs::types::{JobId, JobState};
use async_trait::async_trait;
pub use error::DatabaseError;

/// Trait defining the project queue operations
///
/// Implementations must make [`JobQueue::claim`] a single atomic operation: for any job, at most
/// one caller ever observes it leave `pending`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// init_schema - Create the queue tables if they do not exist yet
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// disconnect - Close the connection to the database
    async fn disconnect(&self) -> Result<(), DatabaseError>;

    /// enqueue - Validate `config` and store a new `pending` job
    async fn enqueue(&self, config: &JobConfig) -> Result<Job, DatabaseError>;

    /// claim - Flip the oldest unlocked `pending` job to `running` and return it
    async fn claim(&self) -> Result<Option<Job>, DatabaseError>;

    /// get - Fetch one job regardless of its state
    async fn get(&self, id: JobId) -> Result<Job, DatabaseError>;

    /// update_state - Unconditional state transition
    async fn update_state(&self, id: JobId, state: JobState) -> Result<(), DatabaseError>;

    /// finish - Move a `running` job to a terminal state.
    /// Fails with [`DatabaseError::ClaimRace`] when the job is no longer `running`.
    async fn finish(&self, id: JobId, state: JobState) -> Result<(), DatabaseError>;

    /// append_log - Durable, ordered append to the job log
    async fn append_log(&self, id: JobId, message: &str) -> Result<(), DatabaseError>;

    /// get_logs - All log lines of a job in append order
    async fn get_logs(&self, id: JobId) -> Result<Vec<LogEntry>, DatabaseError>;

    /// reset - Put a terminal job back to `pending` so it runs again
    async fn reset(&self, id: JobId) -> Result<Job, DatabaseError>;

    /// register_partition - Create-on-first-use. Returns true only for the caller that created it
    async fn register_partition(&self, partition_id: &str) -> Result<bool, DatabaseError>;

    /// list_partitions - All registered partitions, oldest first
    async fn list_partitions(&self) -> Result<Vec<String>, DatabaseError>;
}
