use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use provider::aws::AWSConfigCliArgs;

pub mod database;
pub mod provider;
pub mod service;
pub mod storage;

#[derive(Parser, Debug)]
#[command(
    name = "splat-orchestrator",
    about = "Splat Orchestrator - multi-stage reconstruction pipeline runner",
    long_about = "Splat Orchestrator claims pending projects from a PostgreSQL queue, runs their \
    reconstruction pipeline and publishes stage artifacts as indexed zip archives in S3.",
    after_help = "Examples:\n  \
    splat-orchestrator setup\n  \
    splat-orchestrator enqueue --config project.json\n  \
    splat-orchestrator run --graph --sweep-mode poll\n  \
    splat-orchestrator artifact extract --partition 42 --name splat --member point_cloud.ply"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Claim and run pending projects until the queue is drained (or forever with --sweep-mode poll)
    Run {
        #[command(flatten)]
        run_command: Box<RunCmd>,
    },
    /// Run one project by id, unless a worker is already running it
    Process {
        #[arg(long)]
        job_id: i64,
        #[command(flatten)]
        run_command: Box<RunCmd>,
    },
    /// Ensure one reconstruction stage (and its upstream stages) for a project
    Stage {
        #[arg(long)]
        job_id: i64,
        #[arg(long)]
        stage: String,
        #[command(flatten)]
        run_command: Box<RunCmd>,
    },
    /// Validate a project config (JSON file) and add it to the queue
    Enqueue {
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        #[command(flatten)]
        database_command: DatabaseCmd,
    },
    /// Put a finished project back to pending
    Reset {
        #[arg(long)]
        job_id: i64,
        #[command(flatten)]
        database_command: DatabaseCmd,
    },
    /// Print the log of a project
    Logs {
        #[arg(long)]
        job_id: i64,
        #[command(flatten)]
        database_command: DatabaseCmd,
    },
    /// Create the queue schema
    Setup {
        #[command(flatten)]
        database_command: DatabaseCmd,
    },
    /// Push, pull or partially extract artifacts
    Artifact {
        #[command(flatten)]
        artifact_command: Box<ArtifactCmd>,
    },
}

/// Everything needed to drive projects: queue, storage, process execution
#[derive(Args, Debug, Clone)]
pub struct RunCmd {
    #[clap(flatten)]
    pub postgres_args: database::postgres::PostgresCliArgs,

    #[clap(flatten)]
    pub aws_config_args: AWSConfigCliArgs,

    #[clap(flatten)]
    pub aws_s3_args: storage::aws_s3::AWSS3CliArgs,

    #[clap(flatten)]
    pub service_args: service::ServiceCliArgs,
}

/// Queue-only commands
#[derive(Args, Debug, Clone)]
pub struct DatabaseCmd {
    #[clap(flatten)]
    pub postgres_args: database::postgres::PostgresCliArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ArtifactCmd {
    #[command(subcommand)]
    pub action: ArtifactAction,

    #[clap(flatten)]
    pub aws_config_args: AWSConfigCliArgs,

    #[clap(flatten)]
    pub aws_s3_args: storage::aws_s3::AWSS3CliArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ArtifactAction {
    /// Archive a directory and upload it as `<partition>/<name>.zip`
    Push {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        partition: String,
        #[arg(long)]
        name: String,
        /// Also upload the member offset index
        #[arg(long)]
        index: bool,
    },
    /// Download and unpack an artifact into a directory
    Pull {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        partition: String,
        #[arg(long)]
        name: String,
        /// Replace the directory content if it already exists
        #[arg(long)]
        replace: bool,
    },
    /// Read a single member of an indexed artifact with one ranged request
    Extract {
        #[arg(long)]
        partition: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        member: String,
        /// Write the member here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
