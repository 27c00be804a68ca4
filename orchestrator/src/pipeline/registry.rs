use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::client::database::JobQueue;
use crate::pipeline::error::PipelineError;
use crate::pipeline::graph::validate_partition_id;

/// Explicit registry of partitions, created on first use.
///
/// The queue's upsert makes registration single-writer across workers; the in-process set
/// coalesces repeated registrations from this worker so the database is asked once per partition.
pub struct PartitionRegistry {
    queue: Arc<dyn JobQueue>,
    workspace: PathBuf,
    known: Mutex<HashSet<String>>,
}

impl PartitionRegistry {
    pub fn new(queue: Arc<dyn JobQueue>, workspace: impl Into<PathBuf>) -> Self {
        Self { queue, workspace: workspace.into(), known: Mutex::new(HashSet::new()) }
    }

    /// Register `partition_id` if needed and return its working directory.
    pub async fn ensure(&self, partition_id: &str) -> Result<PathBuf, PipelineError> {
        validate_partition_id(partition_id)?;
        let dir = self.workspace.join(partition_id);

        let mut known = self.known.lock().await;
        if known.contains(partition_id) {
            return Ok(dir);
        }

        if self.queue.register_partition(partition_id).await? {
            info!(partition = %partition_id, "Registered new partition");
        } else {
            debug!(partition = %partition_id, "Partition already registered");
        }
        tokio::fs::create_dir_all(&dir).await?;
        known.insert(partition_id.to_string());

        Ok(dir)
    }
}
