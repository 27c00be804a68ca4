use std::path::PathBuf;
use std::time::Duration;

use crate::cli::service::ServiceCliArgs;
use crate::worker::config::{FailurePolicy, SweepMode};

/// How a claimed job's pipeline is driven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The whole pipeline is one `make -f <makefile>` process per project
    Makefile { makefile: PathBuf },
    /// Stages run one by one through the reconstruction pipeline graph
    Graph,
}

#[derive(Debug, Clone)]
pub struct ServiceParams {
    /// Root of the per-partition working directories
    pub workspace: PathBuf,
    /// Directory holding the stage scripts
    pub scripts_dir: PathBuf,
    pub execution: ExecutionMode,
    pub sweep_mode: SweepMode,
    pub failure_policy: FailurePolicy,
    /// Polling interval when no jobs available (milliseconds)
    pub poll_interval_ms: u64,
    /// Upper bound of the error backoff (milliseconds)
    pub max_backoff_ms: u64,
    /// Kill a job's process after this long
    pub job_timeout: Option<Duration>,
    /// Capacity of the channel between a process' output readers and the log writer
    pub log_channel_capacity: usize,
}

impl From<ServiceCliArgs> for ServiceParams {
    fn from(args: ServiceCliArgs) -> Self {
        let execution = match args.makefile {
            Some(makefile) if !args.graph => ExecutionMode::Makefile { makefile },
            _ => ExecutionMode::Graph,
        };
        Self {
            workspace: args.workspace,
            scripts_dir: args.scripts_dir,
            execution,
            sweep_mode: args.sweep_mode,
            failure_policy: args.failure_policy,
            poll_interval_ms: args.poll_interval_ms,
            max_backoff_ms: args.max_backoff_ms,
            job_timeout: args.job_timeout_secs.map(Duration::from_secs),
            log_channel_capacity: args.log_channel_capacity,
        }
    }
}
