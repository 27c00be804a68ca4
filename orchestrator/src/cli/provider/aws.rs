use clap::Args;
use serde::Serialize;

/// Parameters used to config AWS.
#[derive(Debug, Clone, Args, Serialize)]
pub struct AWSConfigCliArgs {
    /// The AWS region. Falls back to the default provider chain when not set.
    #[arg(env = "SPLAT_ORCHESTRATOR_AWS_REGION", long)]
    pub aws_region: Option<String>,
}
