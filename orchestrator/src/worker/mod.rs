pub mod config;
pub mod runner;
#[allow(clippy::module_inception)]
pub mod worker;

use config::WorkerConfig;
use worker::{SweepSummary, Worker};

use crate::{core::config::Config, OrchestratorResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the worker loop with the provided configuration
///
/// # Arguments
/// * `config` - The configuration for the worker
/// * `shutdown_token` - Cancelled on shutdown; stops the loop and kills a running job's process
///
/// # Returns
/// * `OrchestratorResult<SweepSummary>` - How many jobs completed and failed
pub async fn run_worker(config: Arc<Config>, shutdown_token: CancellationToken) -> OrchestratorResult<SweepSummary> {
    info!("Initializing worker");
    let worker_config = WorkerConfig::from(config.params());
    Worker::new(worker_config, config, shutdown_token).run().await
}
