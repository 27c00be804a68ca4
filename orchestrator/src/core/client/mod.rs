// Client abstractions module - contains all client interface traits

pub mod command;
pub mod database;
pub mod storage;

// Re-export commonly used types
pub use command::{CommandExecutor, ProcessExecutor};
pub use database::{postgres::PostgresJobQueue, JobQueue};
pub use storage::{s3::AWSS3, StorageClient};
