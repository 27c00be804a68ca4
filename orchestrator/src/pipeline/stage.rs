use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::artifact::ArtifactStore;
use crate::core::client::command::{CommandExecutor, CommandSpec, ProcessHandle};
use crate::pipeline::error::PipelineError;

/// Output lines kept for a [`PipelineError::StageFailure`]
pub const FAILURE_OUTPUT_LINES: usize = 50;

/// Destination of the output lines of stage commands
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_line(&self, line: &str) -> Result<(), PipelineError>;
}

/// The work a stage does to fill its output directory
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError>;
}

/// Everything a stage run shares with the rest of the pipeline run
#[derive(Clone)]
pub struct ExecutionEnv {
    pub store: ArtifactStore,
    pub executor: Arc<dyn CommandExecutor>,
    pub log: Arc<dyn LogSink>,
    pub cancel: CancellationToken,
    /// Directory holding the stage scripts
    pub scripts_dir: PathBuf,
}

/// Handed to a [`StageAction`] for one run of one stage on one partition
pub struct StageContext {
    pub partition_id: String,
    pub stage: String,
    /// Directory the action writes its artifact into
    pub output_dir: PathBuf,
    inputs: HashMap<String, PathBuf>,
    env: ExecutionEnv,
}

impl StageContext {
    pub fn new(
        partition_id: impl Into<String>,
        stage: impl Into<String>,
        output_dir: PathBuf,
        inputs: HashMap<String, PathBuf>,
        env: ExecutionEnv,
    ) -> Self {
        Self { partition_id: partition_id.into(), stage: stage.into(), output_dir, inputs, env }
    }

    /// Local path of the artifact of the upstream stage `stage`
    pub fn input(&self, stage: &str) -> Result<&Path, PipelineError> {
        self.inputs
            .get(stage)
            .map(PathBuf::as_path)
            .ok_or_else(|| PipelineError::MissingInput { stage: self.stage.clone(), input: stage.to_string() })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.env.store
    }

    /// Working directory of the partition
    pub fn partition_dir(&self) -> PathBuf {
        self.env.store.workspace().join(&self.partition_id)
    }

    /// A script from the scripts directory, run from the partition directory
    pub fn script(&self, name: &str) -> Result<CommandSpec, PipelineError> {
        Ok(CommandSpec::script(&self.env.scripts_dir, name)?.cwd(self.partition_dir()))
    }

    pub async fn log(&self, message: &str) -> Result<(), PipelineError> {
        self.env.log.write_line(message).await
    }

    /// Run `spec` to completion, forwarding every output line to the log.
    pub async fn run(&self, spec: CommandSpec) -> Result<(), PipelineError> {
        self.drive(spec, true).await.map(|_| ())
    }

    /// Run `spec` to completion and return its output lines instead of logging them.
    pub async fn capture(&self, spec: CommandSpec) -> Result<Vec<String>, PipelineError> {
        self.drive(spec, false).await
    }

    async fn drive(&self, spec: CommandSpec, forward: bool) -> Result<Vec<String>, PipelineError> {
        debug!(partition = %self.partition_id, stage = %self.stage, command = %spec, "Running stage command");
        let mut handle = self.env.executor.spawn(spec).await?;
        let mut output = VecDeque::new();

        loop {
            let next = tokio::select! {
                line = handle.next_line() => Some(line),
                _ = self.env.cancel.cancelled() => None,
            };
            let line = match next {
                Some(Some(line)) => line,
                Some(None) => break,
                None => {
                    self.stop(handle).await;
                    return Err(PipelineError::Cancelled { stage: self.stage.clone() });
                }
            };

            if forward {
                if let Err(e) = self.env.log.write_line(&line).await {
                    self.stop(handle).await;
                    return Err(e);
                }
                if output.len() == FAILURE_OUTPUT_LINES {
                    output.pop_front();
                }
            }
            output.push_back(line);
        }

        let exit = handle.wait().await?;
        if !exit.success() {
            return Err(PipelineError::StageFailure {
                stage: self.stage.clone(),
                exit_code: exit.code,
                output: output.into(),
            });
        }
        Ok(output.into())
    }

    async fn stop(&self, handle: ProcessHandle) {
        handle.kill();
        match handle.wait().await {
            Ok(exit) => warn!(partition = %self.partition_id, stage = %self.stage, exit = %exit, "Stopped stage command"),
            Err(e) => warn!(partition = %self.partition_id, stage = %self.stage, error = %e, "Failed to stop stage command"),
        }
    }
}
