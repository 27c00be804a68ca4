use clap::Parser as _;
use dotenvy::dotenv;
use splat_orchestrator::artifact::{Artifact, ArtifactStore};
use splat_orchestrator::cli::{ArtifactAction, ArtifactCmd, Cli, Commands, DatabaseCmd, RunCmd};
use splat_orchestrator::core::client::database::JobQueue;
use splat_orchestrator::core::client::{PostgresJobQueue, AWSS3};
use splat_orchestrator::core::config::Config;
use splat_orchestrator::types::jobs::config::JobConfig;
use splat_orchestrator::types::jobs::types::JobId;
use splat_orchestrator::types::params::cloud_provider::AWSCredentials;
use splat_orchestrator::types::params::database::DatabaseArgs;
use splat_orchestrator::types::params::StorageArgs;
use splat_orchestrator::utils::logging::init_logging;
use splat_orchestrator::utils::signal_handler::SignalHandler;
use splat_orchestrator::utils::write_stdout;
use splat_orchestrator::worker::run_worker;
use splat_orchestrator::worker::runner::JobRunner;
use splat_orchestrator::OrchestratorResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, error_chain = ?e, "Splat orchestrator command failed");
        std::process::exit(1);
    }
}

async fn execute(command: Commands) -> OrchestratorResult<()> {
    match command {
        Commands::Run { run_command } => {
            debug!("Executing run command with args: {:?}", run_command);
            run_orchestrator(&run_command).await
        }
        Commands::Process { job_id, run_command } => {
            with_config(&run_command, |config, shutdown| async move {
                JobRunner::new(config).process_job(JobId(job_id), &shutdown).await?;
                Ok(())
            })
            .await
        }
        Commands::Stage { job_id, stage, run_command } => {
            with_config(&run_command, |config, shutdown| async move {
                JobRunner::new(config).ensure_stage(JobId(job_id), &stage, &shutdown).await?;
                Ok(())
            })
            .await
        }
        Commands::Enqueue { config, database_command } => {
            let payload = tokio::fs::read(&config).await?;
            let job_config: JobConfig = serde_json::from_slice(&payload)?;
            with_queue(&database_command, |queue| async move {
                let job = queue.enqueue(&job_config).await?;
                Ok(write_stdout(format!("{}\n", job.id).as_bytes()).await?)
            })
            .await
        }
        Commands::Reset { job_id, database_command } => {
            with_queue(&database_command, |queue| async move {
                let job = queue.reset(JobId(job_id)).await?;
                info!(job_id = %job.id, state = %job.state, "Job reset");
                Ok(())
            })
            .await
        }
        Commands::Logs { job_id, database_command } => {
            with_queue(&database_command, |queue| async move {
                let mut out = String::new();
                for entry in queue.get_logs(JobId(job_id)).await? {
                    out.push_str(&format!("{} {}\n", entry.time.to_rfc3339(), entry.message));
                }
                Ok(write_stdout(out.as_bytes()).await?)
            })
            .await
        }
        Commands::Setup { database_command } => {
            with_queue(&database_command, |queue| async move {
                queue.init_schema().await?;
                info!("Queue schema ready");
                Ok(())
            })
            .await
        }
        Commands::Artifact { artifact_command } => run_artifact_command(&artifact_command).await,
    }
}

async fn run_orchestrator(run_cmd: &RunCmd) -> OrchestratorResult<()> {
    with_config(run_cmd, |config, shutdown| async move {
        let summary = run_worker(config, shutdown).await?;
        info!(completed = summary.completed, failed = summary.failed, "Sweep finished");
        Ok(())
    })
    .await
}

/// Build the config, listen for shutdown signals, run `f`, then close the config
async fn with_config<F, Fut>(run_cmd: &RunCmd, f: F) -> OrchestratorResult<()>
where
    F: FnOnce(Arc<Config>, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = OrchestratorResult<()>>,
{
    let config = Arc::new(Config::from_run_cmd(run_cmd).await?);
    let shutdown = CancellationToken::new();
    let signals = SignalHandler::new(shutdown.clone()).spawn();

    let result = f(config.clone(), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = signals.await {
        debug!(error = %e, "Signal handler task ended abnormally");
    }
    config.close().await?;
    result
}

async fn with_queue<F, Fut>(database_cmd: &DatabaseCmd, f: F) -> OrchestratorResult<()>
where
    F: FnOnce(Arc<PostgresJobQueue>) -> Fut,
    Fut: std::future::Future<Output = OrchestratorResult<()>>,
{
    let queue = Arc::new(PostgresJobQueue::new(&DatabaseArgs::try_from(database_cmd)?).await?);
    let result = f(queue.clone()).await;
    queue.disconnect().await?;
    result
}

async fn run_artifact_command(artifact_cmd: &ArtifactCmd) -> OrchestratorResult<()> {
    let storage_args = StorageArgs::try_from(artifact_cmd)?;
    let aws_config = AWSCredentials::from(artifact_cmd.aws_config_args.clone()).get_aws_config().await;
    let storage = Arc::new(AWSS3::new(&aws_config, Some(&storage_args)));
    let store = ArtifactStore::new(storage, std::env::current_dir()?);

    match &artifact_cmd.action {
        ArtifactAction::Push { path, partition, name, index } => {
            store.push(path, &Artifact::new(partition, name), *index).await?;
        }
        ArtifactAction::Pull { path, partition, name, replace } => {
            let outcome = store.pull(path, &Artifact::new(partition, name), *replace).await?;
            info!(outcome = ?outcome, path = %path.display(), "Pull finished");
        }
        ArtifactAction::Extract { partition, name, member, output } => {
            let content = store.extract_file(&Artifact::new(partition, name), member).await?;
            match output {
                Some(output) => tokio::fs::write(output, &content).await?,
                None => write_stdout(&content).await?,
            }
        }
    }
    Ok(())
}
