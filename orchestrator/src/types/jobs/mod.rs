pub mod config;
pub mod job_item;
pub mod types;
