use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::cli::RunCmd;
use crate::core::client::command::{CommandExecutor, ProcessExecutor};
use crate::core::client::database::JobQueue;
use crate::core::client::storage::StorageClient;
use crate::core::client::{PostgresJobQueue, AWSS3};
use crate::pipeline::PartitionRegistry;
use crate::types::params::cloud_provider::AWSCredentials;
use crate::types::params::database::DatabaseArgs;
use crate::types::params::service::ServiceParams;
use crate::types::params::StorageArgs;
use crate::OrchestratorResult;

/// The app config: the handles a worker uses, built once and passed around explicitly.
pub struct Config {
    /// Service configuration
    params: ServiceParams,
    /// The project queue
    queue: Arc<dyn JobQueue>,
    /// Remote blob store
    storage: Arc<dyn StorageClient>,
    /// Runs stage tools and makefiles
    executor: Arc<dyn CommandExecutor>,
    /// Artifacts over `storage`, materialized under the workspace
    store: ArtifactStore,
    partitions: Arc<PartitionRegistry>,
}

impl Config {
    pub fn new(
        params: ServiceParams,
        queue: Arc<dyn JobQueue>,
        storage: Arc<dyn StorageClient>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let store = ArtifactStore::new(storage.clone(), params.workspace.clone());
        let partitions = Arc::new(PartitionRegistry::new(queue.clone(), params.workspace.clone()));
        Self { params, queue, storage, executor, store, partitions }
    }

    /// Connect every client the run command needs
    pub async fn from_run_cmd(run_cmd: &RunCmd) -> OrchestratorResult<Self> {
        let params = ServiceParams::from(run_cmd.service_args.clone());
        let database_args = DatabaseArgs::try_from(run_cmd)?;
        let storage_args = StorageArgs::try_from(run_cmd)?;

        let aws_config = AWSCredentials::from(run_cmd.aws_config_args.clone()).get_aws_config().await;
        let storage: Arc<dyn StorageClient> = Arc::new(AWSS3::new(&aws_config, Some(&storage_args)));
        let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(&database_args).await?);
        let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor::new(params.log_channel_capacity));

        tokio::fs::create_dir_all(&params.workspace).await?;
        info!(
            workspace = %params.workspace.display(),
            bucket = %storage_args.bucket_identifier,
            schema = %database_args.schema,
            "Configuration initialized"
        );

        Ok(Self::new(params, queue, storage, executor))
    }

    pub fn params(&self) -> &ServiceParams {
        &self.params
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn partitions(&self) -> &Arc<PartitionRegistry> {
        &self.partitions
    }

    /// Release the database connection
    pub async fn close(&self) -> OrchestratorResult<()> {
        self.queue.disconnect().await?;
        debug!("Configuration closed");
        Ok(())
    }
}
