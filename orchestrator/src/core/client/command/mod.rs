pub mod error;
pub mod process;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
pub use error::CommandError;
pub use process::ProcessExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self { program: program.as_ref().to_os_string(), args: Vec::new(), cwd: None, env: Vec::new() }
    }

    /// Run a script from `bin_dir` with the interpreter matching its extension
    /// (`.py` with python, `.sh` with bash).
    pub fn script(bin_dir: &Path, name: &str) -> Result<Self, CommandError> {
        let interpreter = match Path::new(name).extension().and_then(OsStr::to_str) {
            Some("py") => "python",
            Some("sh") => "bash",
            _ => return Err(CommandError::UnknownScriptType(name.to_string())),
        };
        Ok(Self::new(interpreter).arg(bin_dir.join(name)))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Program name for logs
    pub fn program_name(&self) -> String {
        Path::new(&self.program).file_name().unwrap_or(self.program.as_os_str()).to_string_lossy().into_owned()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when the process was terminated by a signal
    pub code: Option<i32>,
    /// The process was stopped through [`ProcessHandle::kill`]
    pub killed: bool,
}

impl ProcessExit {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code), killed: false }
    }

    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.killed, self.code) {
            (true, _) => write!(f, "killed"),
            (false, Some(code)) => write!(f, "exit code {code}"),
            (false, None) => write!(f, "terminated by signal"),
        }
    }
}

/// A running process: its merged stdout + stderr lines, its exit, and a kill switch.
///
/// The line channel closes once both output streams are exhausted, so consumers read
/// [`ProcessHandle::next_line`] until `None` and then [`ProcessHandle::wait`].
pub struct ProcessHandle {
    lines: mpsc::Receiver<String>,
    exit: JoinHandle<Result<ProcessExit, CommandError>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn new(
        lines: mpsc::Receiver<String>,
        exit: JoinHandle<Result<ProcessExit, CommandError>>,
        kill: CancellationToken,
    ) -> Self {
        Self { lines, exit, kill }
    }

    /// Next output line, or `None` once the process closed its output
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Ask the process to stop. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub async fn wait(self) -> Result<ProcessExit, CommandError> {
        drop(self.lines);
        self.exit.await.map_err(|e| CommandError::TaskFailed(e.to_string()))?
    }
}

/// Trait defining process execution
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Start `spec` and stream its output. Fails only if the process could not be started.
    async fn spawn(&self, spec: CommandSpec) -> Result<ProcessHandle, CommandError>;
}
