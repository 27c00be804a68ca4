use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::core::client::command::{CommandSpec, ProcessExit};
use crate::core::client::database::JobQueue;
use crate::core::config::Config;
use crate::error::job::{JobError, JobResult};
use crate::pipeline::reconstruction::{reconstruction_graph, TERMINAL_STAGE};
use crate::pipeline::{ExecutionEnv, LogSink, PipelineError};
use crate::types::jobs::config::JobConfig;
use crate::types::jobs::job_item::Job;
use crate::types::jobs::types::{JobId, JobState};
use crate::types::params::service::ExecutionMode;

pub const MAKE: &str = "make";
pub const PROJECT_ID_ENV: &str = "PROJECT_ID";
pub const CONFIG_ENV: &str = "CONFIG";

/// Appends every line to the log of one job
pub struct JobLogSink {
    queue: Arc<dyn JobQueue>,
    id: JobId,
}

impl JobLogSink {
    pub fn new(queue: Arc<dyn JobQueue>, id: JobId) -> Self {
        Self { queue, id }
    }
}

#[async_trait]
impl LogSink for JobLogSink {
    async fn write_line(&self, line: &str) -> Result<(), PipelineError> {
        Ok(self.queue.append_log(self.id, line).await?)
    }
}

/// Drives claimed jobs to a terminal state.
pub struct JobRunner {
    config: Arc<Config>,
}

impl JobRunner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run a job this worker holds in `running` and record how it ended.
    ///
    /// Any error is appended to the job log as a final line and the job ends `failed`.
    /// Cancelling `cancel` or hitting the job timeout kills the job's process first.
    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> JobResult<()> {
        let span = info_span!("job", job_id = %job.id);
        async {
            info!(state = %job.state, "Running job");
            let result = self.execute_with_timeout(job, cancel).await;
            self.record_outcome(job.id, result).await
        }
        .instrument(span)
        .await
    }

    /// Operator entry point: run one job by id. Pending and finished jobs are run again; a job
    /// another worker is running is refused.
    pub async fn process_job(&self, id: JobId, cancel: &CancellationToken) -> JobResult<()> {
        let job = self.config.queue().get(id).await?;
        if job.state == JobState::Running {
            warn!(job_id = %id, "Job is already running on a worker");
            return Err(JobError::InvalidState { id, state: job.state });
        }

        self.config.queue().update_state(id, JobState::Running).await?;
        let job = Job { state: JobState::Running, ..job };
        self.run(&job, cancel).await
    }

    /// Ensure one reconstruction stage for the job's partition, without touching the job state.
    /// Stage output still goes to the job log.
    pub async fn ensure_stage(&self, id: JobId, stage: &str, cancel: &CancellationToken) -> JobResult<PathBuf> {
        let job = self.config.queue().get(id).await?;
        let path = self.ensure_graph_stage(&job, stage, cancel.clone()).await?;
        info!(job_id = %id, stage = %stage, path = %path.display(), "Stage available");
        Ok(path)
    }

    async fn execute_with_timeout(&self, job: &Job, cancel: &CancellationToken) -> JobResult<()> {
        let token = cancel.child_token();
        let work = self.execute(job, token.clone());
        tokio::pin!(work);

        let Some(timeout) = self.config.params().job_timeout else {
            return work.await;
        };

        tokio::select! {
            result = &mut work => return result,
            _ = tokio::time::sleep(timeout) => {}
        }

        warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "Job timed out, stopping it");
        token.cancel();
        if let Err(e) = work.await {
            warn!(job_id = %job.id, error = %e, "Job stopped after timeout");
        }
        Err(JobError::TimedOut { id: job.id, timeout_secs: timeout.as_secs() })
    }

    async fn execute(&self, job: &Job, cancel: CancellationToken) -> JobResult<()> {
        match &self.config.params().execution {
            ExecutionMode::Makefile { makefile } => self.run_makefile(job, makefile, cancel).await,
            ExecutionMode::Graph => {
                self.ensure_graph_stage(job, TERMINAL_STAGE, cancel).await?;
                Ok(())
            }
        }
    }

    /// The whole pipeline as one `make` process in the partition directory
    async fn run_makefile(&self, job: &Job, makefile: &Path, cancel: CancellationToken) -> JobResult<()> {
        job.pipeline_config()?;

        let partition_id = job.partition_id();
        let dir = self.config.partitions().ensure(&partition_id).await?;
        let spec = CommandSpec::new(MAKE)
            .arg("-f")
            .arg(makefile)
            .cwd(dir)
            .env(PROJECT_ID_ENV, &partition_id)
            .env(CONFIG_ENV, serde_json::to_string(&job.config)?);

        let mut handle = self.config.executor().spawn(spec).await?;
        let queue = self.config.queue();

        loop {
            let next = tokio::select! {
                line = handle.next_line() => Some(line),
                _ = cancel.cancelled() => None,
            };
            match next {
                Some(Some(line)) => {
                    if let Err(e) = queue.append_log(job.id, &line).await {
                        handle.kill();
                        log_stopped(job.id, handle.wait().await);
                        return Err(JobError::LogForwarding { id: job.id, reason: e.to_string() });
                    }
                }
                Some(None) => break,
                None => {
                    handle.kill();
                    log_stopped(job.id, handle.wait().await);
                    return Err(JobError::Cancelled { id: job.id });
                }
            }
        }

        let exit = handle.wait().await?;
        if !exit.success() {
            return Err(JobError::ProcessFailed { id: job.id, exit_code: exit.code });
        }
        Ok(())
    }

    async fn ensure_graph_stage(&self, job: &Job, stage: &str, cancel: CancellationToken) -> JobResult<PathBuf> {
        let graph = match job.pipeline_config()? {
            JobConfig::Reconstruction(config) => reconstruction_graph(&config)?,
        };

        let partition_id = job.partition_id();
        self.config.partitions().ensure(&partition_id).await?;

        let env = ExecutionEnv {
            store: self.config.store().clone(),
            executor: self.config.executor().clone(),
            log: Arc::new(JobLogSink::new(self.config.queue().clone(), job.id)),
            cancel,
            scripts_dir: self.config.params().scripts_dir.clone(),
        };

        match graph.ensure(&env, &partition_id, stage).await {
            Ok(path) => Ok(path),
            Err(PipelineError::Cancelled { .. }) => Err(JobError::Cancelled { id: job.id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the job to its terminal state. Errors are logged to the job before it is marked failed.
    async fn record_outcome(&self, id: JobId, result: JobResult<()>) -> JobResult<()> {
        let queue = self.config.queue();

        match result {
            Ok(()) => {
                queue.finish(id, JobState::Complete).await?;
                info!(job_id = %id, "Job complete");
                Ok(())
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Job failed");
                if let Err(log_error) = queue.append_log(id, &e.to_string()).await {
                    warn!(job_id = %id, error = %log_error, "Failed to append the error to the job log");
                }
                if let Err(finish_error) = queue.finish(id, JobState::Failed).await {
                    error!(job_id = %id, error = %finish_error, "Failed to mark job as failed");
                }
                Err(e)
            }
        }
    }
}

fn log_stopped(id: JobId, exit: Result<ProcessExit, crate::core::client::command::CommandError>) {
    match exit {
        Ok(exit) => info!(job_id = %id, exit = %exit, "Stopped job process"),
        Err(e) => warn!(job_id = %id, error = %e, "Failed to stop job process"),
    }
}
