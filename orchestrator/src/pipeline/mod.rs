pub mod error;
pub mod graph;
pub mod reconstruction;
pub mod registry;
pub mod stage;

pub use error::PipelineError;
pub use graph::{PipelineGraph, Stage};
pub use registry::PartitionRegistry;
pub use stage::{ExecutionEnv, LogSink, StageAction, StageContext};
