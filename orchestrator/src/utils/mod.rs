pub mod logging;
pub mod signal_handler;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write command output (job ids, logs, extracted members) to stdout and flush it.
pub async fn write_stdout(bytes: &[u8]) -> std::io::Result<()> {
    write_all_flushed(&mut tokio::io::stdout(), bytes).await
}

async fn write_all_flushed<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
