use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown script type: {0}")]
    UnknownScriptType(String),

    #[error("Process {0} is not piped")]
    MissingPipe(&'static str),

    #[error("IO error while supervising process: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Process supervisor task failed: {0}")]
    TaskFailed(String),
}
