use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info, warn};

use crate::core::client::database::constant::{JOB_COLUMNS, PARTITIONS_TABLE, PROJECTS_TABLE, PROJECT_LOGS_TABLE};
use crate::core::client::database::{DatabaseError, JobQueue};
use crate::types::jobs::config::JobConfig;
use crate::types::jobs::job_item::{Job, LogEntry};
use crate::types::jobs::types::{JobId, JobState};
use crate::types::params::database::DatabaseArgs;

/// Project queue backed by PostgreSQL.
///
/// The claim is expressed as one conditional `UPDATE ... RETURNING` whose target row is picked
/// with `FOR UPDATE SKIP LOCKED`, so row selection and the `running` transition commit together.
pub struct PostgresJobQueue {
    client: Client,
    connection: Mutex<Option<JoinHandle<()>>>,
    schema: String,
}

impl PostgresJobQueue {
    pub async fn new(args: &DatabaseArgs) -> Result<Self, DatabaseError> {
        validate_identifier(&args.schema)?;

        let (client, connection) = tokio_postgres::connect(&args.connection_uri, NoTls).await?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        info!(schema = %args.schema, "Connected to PostgreSQL");
        Ok(Self { client, connection: Mutex::new(Some(handle)), schema: args.schema.clone() })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn ensure_connected(&self) -> Result<(), DatabaseError> {
        if self.connection.lock().await.is_none() || self.client.is_closed() {
            return Err(DatabaseError::Disconnected);
        }
        Ok(())
    }

    /// Current state of a job, or `JobNotFound`
    async fn current_state(&self, id: JobId) -> Result<JobState, DatabaseError> {
        let sql = format!("SELECT state FROM {} WHERE id = $1", self.table(PROJECTS_TABLE));
        let row = self.client.query_opt(&sql, &[&id.0]).await?.ok_or(DatabaseError::JobNotFound(id))?;
        parse_state(id, row.try_get("state")?)
    }
}

fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidSchemaName(name.to_string()))
    }
}

fn parse_state(id: JobId, state: String) -> Result<JobState, DatabaseError> {
    JobState::from_str(&state).map_err(|_| DatabaseError::InvalidState {
        id,
        state,
        reason: "unknown state stored in the projects table".to_string(),
    })
}

fn job_from_row(row: &Row) -> Result<Job, DatabaseError> {
    let id = JobId(row.try_get("id")?);
    Ok(Job {
        id,
        config: row.try_get("config")?,
        state: parse_state(id, row.try_get("state")?)?,
        created: row.try_get("created")?,
    })
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let statements = format!(
            r"
            CREATE SCHEMA IF NOT EXISTS {schema};
            CREATE TABLE IF NOT EXISTS {projects} (
                id BIGSERIAL PRIMARY KEY,
                config JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (state IN ('pending', 'running', 'complete', 'failed')),
                created TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS projects_pending_idx ON {projects} (created, id) WHERE state = 'pending';
            CREATE TABLE IF NOT EXISTS {logs} (
                id BIGSERIAL PRIMARY KEY,
                project_id BIGINT NOT NULL REFERENCES {projects} (id),
                time TIMESTAMPTZ NOT NULL DEFAULT now(),
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS project_logs_project_idx ON {logs} (project_id, id);
            CREATE TABLE IF NOT EXISTS {partitions} (
                id TEXT PRIMARY KEY,
                created TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            ",
            schema = self.schema,
            projects = self.table(PROJECTS_TABLE),
            logs = self.table(PROJECT_LOGS_TABLE),
            partitions = self.table(PARTITIONS_TABLE),
        );
        self.client.batch_execute(&statements).await?;
        info!(schema = %self.schema, "Queue schema is ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DatabaseError> {
        if let Some(handle) = self.connection.lock().await.take() {
            handle.abort();
            debug!("PostgreSQL connection closed");
        }
        Ok(())
    }

    async fn enqueue(&self, config: &JobConfig) -> Result<Job, DatabaseError> {
        config.validate().map_err(DatabaseError::InvalidConfig)?;
        self.ensure_connected().await?;

        let payload = serde_json::to_value(config)?;
        let sql = format!(
            "INSERT INTO {} (config, state) VALUES ($1, 'pending') RETURNING {JOB_COLUMNS}",
            self.table(PROJECTS_TABLE)
        );
        let row = self.client.query_one(&sql, &[&payload]).await?;
        let job = job_from_row(&row)?;
        info!(job_id = %job.id, pipeline = config.pipeline_name(), "Enqueued job");
        Ok(job)
    }

    async fn claim(&self) -> Result<Option<Job>, DatabaseError> {
        self.ensure_connected().await?;

        let projects = self.table(PROJECTS_TABLE);
        let sql = format!(
            r"
            UPDATE {projects} SET state = 'running'
            WHERE id = (
                SELECT id FROM {projects}
                WHERE state = 'pending'
                ORDER BY created, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "
        );

        match self.client.query_opt(&sql, &[]).await? {
            Some(row) => {
                let job = job_from_row(&row)?;
                debug!(job_id = %job.id, "Claimed job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, id: JobId) -> Result<Job, DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = $1", self.table(PROJECTS_TABLE));
        let row = self.client.query_opt(&sql, &[&id.0]).await?.ok_or(DatabaseError::JobNotFound(id))?;
        job_from_row(&row)
    }

    async fn update_state(&self, id: JobId, state: JobState) -> Result<(), DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("UPDATE {} SET state = $2 WHERE id = $1", self.table(PROJECTS_TABLE));
        let updated = self.client.execute(&sql, &[&id.0, &state.as_ref()]).await?;
        if updated == 0 {
            return Err(DatabaseError::JobNotFound(id));
        }
        debug!(job_id = %id, state = %state, "Updated job state");
        Ok(())
    }

    async fn finish(&self, id: JobId, state: JobState) -> Result<(), DatabaseError> {
        if !state.is_terminal() {
            return Err(DatabaseError::InvalidState {
                id,
                state: state.to_string(),
                reason: "a job can only finish in a terminal state".to_string(),
            });
        }
        self.ensure_connected().await?;

        let sql = format!("UPDATE {} SET state = $2 WHERE id = $1 AND state = 'running'", self.table(PROJECTS_TABLE));
        let updated = self.client.execute(&sql, &[&id.0, &state.as_ref()]).await?;
        if updated == 0 {
            let found = self.current_state(id).await?;
            warn!(job_id = %id, found = %found, "Job left running while this worker owned it");
            return Err(DatabaseError::ClaimRace { id, found });
        }
        debug!(job_id = %id, state = %state, "Finished job");
        Ok(())
    }

    async fn append_log(&self, id: JobId, message: &str) -> Result<(), DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("INSERT INTO {} (project_id, message) VALUES ($1, $2)", self.table(PROJECT_LOGS_TABLE));
        self.client.execute(&sql, &[&id.0, &message]).await?;
        Ok(())
    }

    async fn get_logs(&self, id: JobId) -> Result<Vec<LogEntry>, DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("SELECT time, message FROM {} WHERE project_id = $1 ORDER BY id", self.table(PROJECT_LOGS_TABLE));
        let rows = self.client.query(&sql, &[&id.0]).await?;
        rows.iter()
            .map(|row| Ok(LogEntry { time: row.try_get("time")?, message: row.try_get("message")? }))
            .collect()
    }

    async fn reset(&self, id: JobId) -> Result<Job, DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!(
            "UPDATE {} SET state = 'pending' WHERE id = $1 AND state <> 'running' RETURNING {JOB_COLUMNS}",
            self.table(PROJECTS_TABLE)
        );
        match self.client.query_opt(&sql, &[&id.0]).await? {
            Some(row) => {
                info!(job_id = %id, "Reset job to pending");
                job_from_row(&row)
            }
            None => {
                let state = self.current_state(id).await?;
                Err(DatabaseError::InvalidState {
                    id,
                    state: state.to_string(),
                    reason: "a running job cannot be reset".to_string(),
                })
            }
        }
    }

    async fn register_partition(&self, partition_id: &str) -> Result<bool, DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("INSERT INTO {} (id) VALUES ($1) ON CONFLICT (id) DO NOTHING", self.table(PARTITIONS_TABLE));
        let inserted = self.client.execute(&sql, &[&partition_id]).await?;
        Ok(inserted == 1)
    }

    async fn list_partitions(&self) -> Result<Vec<String>, DatabaseError> {
        self.ensure_connected().await?;
        let sql = format!("SELECT id FROM {} ORDER BY created, id", self.table(PARTITIONS_TABLE));
        let rows = self.client.query(&sql, &[]).await?;
        rows.iter().map(|row| Ok(row.try_get("id")?)).collect()
    }
}
