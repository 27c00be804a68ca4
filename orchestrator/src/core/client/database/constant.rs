/// Schema holding the queue tables when none is configured
pub const DEFAULT_SCHEMA: &str = "api";

/// One row per project job
pub const PROJECTS_TABLE: &str = "projects";

/// Append-only job log. Row order (its serial id) is the log order.
pub const PROJECT_LOGS_TABLE: &str = "project_logs";

/// Registered artifact partitions
pub const PARTITIONS_TABLE: &str = "partitions";

pub const JOB_COLUMNS: &str = "id, config, state, created";
