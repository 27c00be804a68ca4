/// Worker implementation for the project queue
///
/// This worker polls the queue for pending projects, claims them one at a time with the queue's
/// atomic claim and drives each to a terminal state before claiming the next.
use super::config::{FailurePolicy, SweepMode, WorkerConfig};
use super::runner::JobRunner;
use crate::core::config::Config;
use crate::error::job::JobError;
use crate::{OrchestratorError, OrchestratorResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Jobs a sweep drove to a terminal state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub completed: usize,
    pub failed: usize,
}

/// What one poll of the queue did
enum Poll {
    Empty,
    Processed(Result<(), JobError>),
}

pub struct Worker {
    config: WorkerConfig,
    orchestrator_config: Arc<Config>,
    runner: JobRunner,
    shutdown_token: CancellationToken,
    /// Consecutive queue errors, for exponential backoff
    consecutive_errors: u32,
}

impl Worker {
    pub fn new(config: WorkerConfig, orchestrator_config: Arc<Config>, shutdown_token: CancellationToken) -> Self {
        let runner = JobRunner::new(orchestrator_config.clone());
        Self { config, orchestrator_config, runner, shutdown_token, consecutive_errors: 0 }
    }

    /// Run the worker loop until the queue is drained (`Drain`) or shutdown is requested.
    ///
    /// With [`FailurePolicy::Halt`] the first failed job ends the sweep with that job's error.
    pub async fn run(&mut self) -> OrchestratorResult<SweepSummary> {
        info!(
            sweep_mode = %self.config.sweep_mode,
            failure_policy = %self.config.failure_policy,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting worker"
        );
        let mut summary = SweepSummary::default();

        loop {
            if self.shutdown_token.is_cancelled() {
                info!("Worker received shutdown signal");
                break;
            }

            match self.poll_and_process().await {
                Ok(Poll::Processed(result)) => {
                    self.consecutive_errors = 0;
                    match result {
                        Ok(()) => summary.completed += 1,
                        Err(e) => {
                            summary.failed += 1;
                            if self.config.failure_policy == FailurePolicy::Halt {
                                warn!(error = %e, "Halting sweep after failed job");
                                return Err(e.into());
                            }
                        }
                    }
                }
                Ok(Poll::Empty) => {
                    self.consecutive_errors = 0;
                    match self.config.sweep_mode {
                        SweepMode::Drain => {
                            info!("Queue drained");
                            break;
                        }
                        SweepMode::Poll => {
                            debug!("No pending jobs");
                            self.pause(Duration::from_millis(self.config.poll_interval_ms)).await;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        consecutive_errors = self.consecutive_errors + 1,
                        "Error during poll and process"
                    );
                    let backoff_delay = self.config.calculate_backoff(self.consecutive_errors);
                    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                    warn!(backoff_ms = backoff_delay.as_millis(), "Applying exponential backoff");
                    self.pause(backoff_delay).await;
                }
            }
        }

        info!(completed = summary.completed, failed = summary.failed, "Worker stopped");
        Ok(summary)
    }

    /// Claim a job and run it if one is available.
    /// Only queue errors of the claim itself are returned as errors.
    async fn poll_and_process(&self) -> Result<Poll, OrchestratorError> {
        let Some(job) = self.orchestrator_config.queue().claim().await? else {
            return Ok(Poll::Empty);
        };
        debug!(job_id = %job.id, "Successfully claimed job");

        Ok(Poll::Processed(self.runner.run(&job, &self.shutdown_token).await))
    }

    /// Sleep, waking up early on shutdown
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.shutdown_token.cancelled() => {}
        }
    }
}
