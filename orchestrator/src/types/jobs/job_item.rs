use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::job::JobError;
use crate::types::jobs::config::JobConfig;
use crate::types::jobs::types::{JobId, JobState};

/// A project job as stored in the queue table.
///
/// `config` is kept as the raw payload the enqueuer stored; it is decoded into a typed
/// [`JobConfig`] once, at the job boundary, by [`Job::pipeline_config`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub config: serde_json::Value,
    pub state: JobState,
    pub created: DateTime<Utc>,
}

impl Job {
    /// Decode and validate the job's pipeline configuration.
    pub fn pipeline_config(&self) -> Result<JobConfig, JobError> {
        let config: JobConfig = serde_json::from_value(self.config.clone())
            .map_err(|e| JobError::InvalidConfig { id: self.id, reason: e.to_string() })?;
        config.validate().map_err(|reason| JobError::InvalidConfig { id: self.id, reason })?;
        Ok(config)
    }

    pub fn partition_id(&self) -> String {
        self.id.partition_id()
    }
}

/// One line of a job's append-only log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}
