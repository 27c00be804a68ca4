//! Configuration for worker behavior

use std::time::Duration;

use crate::types::params::service::ServiceParams;

/// What the worker does once the queue is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SweepMode {
    /// Stop
    #[default]
    Drain,
    /// Sleep for the poll interval and claim again, until shutdown
    Poll,
}

/// What the worker does after a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep claiming jobs
    #[default]
    Continue,
    /// End the sweep with the job's error
    Halt,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub sweep_mode: SweepMode,
    pub failure_policy: FailurePolicy,
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
}

impl WorkerConfig {
    pub fn new(sweep_mode: SweepMode, failure_policy: FailurePolicy) -> Self {
        Self { sweep_mode, failure_policy, poll_interval_ms: 5_000, max_backoff_ms: 60_000 }
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Delay before the next claim after `consecutive_errors` failed queue cycles:
    /// the poll interval doubled per error, capped at `max_backoff_ms`.
    pub fn calculate_backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 1u64.checked_shl(consecutive_errors.min(32)).unwrap_or(u64::MAX);
        let delay = self.poll_interval_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

impl From<&ServiceParams> for WorkerConfig {
    fn from(params: &ServiceParams) -> Self {
        Self::new(params.sweep_mode, params.failure_policy)
            .with_poll_interval_ms(params.poll_interval_ms)
            .with_max_backoff_ms(params.max_backoff_ms)
    }
}
