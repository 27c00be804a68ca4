use std::path::PathBuf;

use clap::Args;

use crate::worker::config::{FailurePolicy, SweepMode};

fn parse_positive_usize(s: &str) -> Result<usize, String> {
    let value: usize = s.parse().map_err(|_| format!("'{}' is not a valid number", s))?;
    if value == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(value)
}

#[derive(Debug, Clone, Args)]
pub struct ServiceCliArgs {
    /// Root directory of the per-project working directories.
    #[arg(env = "SPLAT_ORCHESTRATOR_WORKSPACE", long, default_value = "workspace")]
    pub workspace: PathBuf,

    /// Directory holding the stage scripts (extract_frames.py, pair_*.py, mapper.sh, ...).
    #[arg(env = "SPLAT_ORCHESTRATOR_SCRIPTS_DIR", long, default_value = "bin")]
    pub scripts_dir: PathBuf,

    /// Run each project as `make -f <MAKEFILE>` inside its working directory.
    #[arg(env = "SPLAT_ORCHESTRATOR_MAKEFILE", long, conflicts_with = "graph")]
    pub makefile: Option<PathBuf>,

    /// Run each project stage by stage through the reconstruction pipeline graph.
    #[arg(env = "SPLAT_ORCHESTRATOR_GRAPH", long)]
    pub graph: bool,

    /// Stop when the queue is empty (drain) or keep polling for new projects (poll).
    #[arg(env = "SPLAT_ORCHESTRATOR_SWEEP_MODE", long, value_enum, default_value_t = SweepMode::Drain)]
    pub sweep_mode: SweepMode,

    /// Whether a failed project stops the sweep.
    #[arg(env = "SPLAT_ORCHESTRATOR_FAILURE_POLICY", long, value_enum, default_value_t = FailurePolicy::Continue)]
    pub failure_policy: FailurePolicy,

    /// Polling interval when no jobs are available, in milliseconds.
    #[arg(env = "SPLAT_ORCHESTRATOR_POLL_INTERVAL_MS", long, default_value = "5000")]
    pub poll_interval_ms: u64,

    /// Upper bound of the backoff applied after queue errors, in milliseconds.
    #[arg(env = "SPLAT_ORCHESTRATOR_MAX_BACKOFF_MS", long, default_value = "60000")]
    pub max_backoff_ms: u64,

    /// Kill a project's process after this many seconds.
    #[arg(env = "SPLAT_ORCHESTRATOR_JOB_TIMEOUT_SECONDS", long)]
    pub job_timeout_secs: Option<u64>,

    /// Number of output lines buffered between a process and the job log. Must be greater than 0.
    #[arg(env = "SPLAT_ORCHESTRATOR_LOG_CHANNEL_CAPACITY", long, default_value = "1024", value_parser = parse_positive_usize)]
    pub log_channel_capacity: usize,
}
