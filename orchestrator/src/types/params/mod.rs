pub mod cloud_provider;
pub mod database;
pub mod service;

use crate::cli::{ArtifactCmd, DatabaseCmd, RunCmd};
use crate::core::client::database::constant::DEFAULT_SCHEMA;
use crate::OrchestratorError;
use database::DatabaseArgs;
use url::Url;

/// StorageArgs - Arguments used to reach the artifact bucket
#[derive(Debug, Clone)]
pub struct StorageArgs {
    /// Bucket name or ARN
    pub bucket_identifier: String,
    /// Custom endpoint for S3 compatible stores
    pub endpoint_url: Option<Url>,
}

/// NOTE: The following implementations convert the command line arguments into the argument
/// structs used to build the clients, validating them on the way.
impl TryFrom<&RunCmd> for StorageArgs {
    type Error = OrchestratorError;
    fn try_from(run_cmd: &RunCmd) -> Result<Self, Self::Error> {
        storage_args(&run_cmd.aws_s3_args)
    }
}

impl TryFrom<&ArtifactCmd> for StorageArgs {
    type Error = OrchestratorError;
    fn try_from(artifact_cmd: &ArtifactCmd) -> Result<Self, Self::Error> {
        storage_args(&artifact_cmd.aws_s3_args)
    }
}

fn storage_args(args: &crate::cli::storage::aws_s3::AWSS3CliArgs) -> Result<StorageArgs, OrchestratorError> {
    let bucket_identifier = args
        .bucket_identifier
        .clone()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| OrchestratorError::RunCommandError("Bucket identifier is required".to_string()))?;
    Ok(StorageArgs { bucket_identifier, endpoint_url: args.endpoint_url.clone() })
}

impl TryFrom<&RunCmd> for DatabaseArgs {
    type Error = OrchestratorError;
    fn try_from(run_cmd: &RunCmd) -> Result<Self, Self::Error> {
        database_args(&run_cmd.postgres_args)
    }
}

impl TryFrom<&DatabaseCmd> for DatabaseArgs {
    type Error = OrchestratorError;
    fn try_from(database_cmd: &DatabaseCmd) -> Result<Self, Self::Error> {
        database_args(&database_cmd.postgres_args)
    }
}

fn database_args(args: &crate::cli::database::postgres::PostgresCliArgs) -> Result<DatabaseArgs, OrchestratorError> {
    let connection_uri = args
        .postgres_connection_url
        .clone()
        .ok_or_else(|| OrchestratorError::RunCommandError("Postgres connection URL is required".to_string()))?;
    let schema = args.postgres_schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
    Ok(DatabaseArgs { connection_uri, schema })
}
