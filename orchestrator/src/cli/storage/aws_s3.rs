use clap::Args;
use url::Url;

/// Parameters used to config AWS S3.
#[derive(Debug, Clone, Args)]
pub struct AWSS3CliArgs {
    /// The ARN / Name of the S3 bucket holding the artifacts.
    /// ARN: arn:aws:s3:::name
    #[arg(env = "SPLAT_ORCHESTRATOR_AWS_S3_BUCKET_IDENTIFIER", long, default_value = Some("splat-artifacts"))]
    pub bucket_identifier: Option<String>,

    /// Endpoint of an S3 compatible store (e.g. MinIO). Uses AWS when not set.
    #[arg(env = "SPLAT_ORCHESTRATOR_AWS_S3_ENDPOINT_URL", long)]
    pub endpoint_url: Option<Url>,
}
