use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::client::command::{CommandError, CommandExecutor, CommandSpec, ProcessExit, ProcessHandle};

pub const DEFAULT_LINE_CHANNEL_CAPACITY: usize = 1024;

/// Runs commands as local child processes.
///
/// One task per output pipe reads lines into a bounded channel and a supervisor task owns the
/// child, so a consumer can stop reading (or kill the process) without blocking on pipe I/O.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    channel_capacity: usize,
}

impl ProcessExecutor {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity: channel_capacity.max(1) }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_CHANNEL_CAPACITY)
    }
}

/// Forward non-blank, trimmed lines of `reader` into `tx`.
/// Keeps draining the pipe after the receiver is gone so the child never blocks on a full pipe.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>, program: String) -> Result<(), CommandError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut receiver_alive = true;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(target: "splat_orchestrator::process", program = %program, "{}", line);
        if receiver_alive && tx.send(line.to_string()).await.is_err() {
            receiver_alive = false;
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn spawn(&self, spec: CommandSpec) -> Result<ProcessHandle, CommandError> {
        let program = spec.program_name();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child =
            command.spawn().map_err(|source| CommandError::SpawnFailed { program: spec.to_string(), source })?;
        debug!(command = %spec, pid = ?child.id(), "Spawned process");

        let stdout = child.stdout.take().ok_or(CommandError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(CommandError::MissingPipe("stderr"))?;

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let readers = [
            tokio::spawn(forward_lines(stdout, tx.clone(), program.clone())),
            tokio::spawn(forward_lines(stderr, tx, program.clone())),
        ];

        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        let exit = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_requested.cancelled() => None,
            };

            let exit = match status {
                Some(status) => {
                    let status = status?;
                    for reader in readers {
                        match reader.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(program = %program, error = %e, "Failed to read process output"),
                            Err(e) => warn!(program = %program, error = %e, "Output reader task failed"),
                        }
                    }
                    ProcessExit { code: status.code(), killed: false }
                }
                None => {
                    child.kill().await?;
                    let status = child.wait().await?;
                    // Grandchildren may still hold the pipes open
                    for reader in readers {
                        reader.abort();
                    }
                    ProcessExit { code: status.code(), killed: true }
                }
            };

            debug!(program = %program, exit = %exit, "Process finished");
            Ok(exit)
        });

        Ok(ProcessHandle::new(rx, exit, kill))
    }
}
