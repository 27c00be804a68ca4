use std::io;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(unix)]
use signal::unix::{signal, SignalKind};

/// Signal types that can trigger shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM - Docker/Kubernetes graceful shutdown
    Terminate,
    /// SIGINT - Ctrl+C interactive shutdown
    Interrupt,
    /// SIGQUIT - Quit signal
    Quit,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
        }
    }
}

/// Turns process signals into a cancelled shutdown token.
///
/// Cancelling the token stops the worker loop and kills the process of the job in flight, which
/// then ends `failed` with a final log line instead of staying `running`.
pub struct SignalHandler {
    shutdown_token: CancellationToken,
}

impl SignalHandler {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self { shutdown_token }
    }

    /// Listen in the background and cancel the token on the first signal
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                signal = Self::wait_for_signal() => match signal {
                    Ok(signal) => {
                        info!("Received shutdown signal: {}", signal);
                        self.shutdown_token.cancel();
                    }
                    Err(e) => error!(error = %e, "Failed to install signal handlers"),
                },
                _ = self.shutdown_token.cancelled() => {}
            }
        })
    }

    #[cfg(unix)]
    async fn wait_for_signal() -> io::Result<ShutdownSignal> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        info!("Signal handler initialized, listening for SIGTERM, SIGINT and SIGQUIT");

        let signal = tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = sigquit.recv() => {
                warn!("Force quit signal received (SIGQUIT)");
                ShutdownSignal::Quit
            }
        };
        Ok(signal)
    }

    #[cfg(not(unix))]
    async fn wait_for_signal() -> io::Result<ShutdownSignal> {
        info!("Signal handler initialized, listening for Ctrl+C");
        signal::ctrl_c().await?;
        Ok(ShutdownSignal::Interrupt)
    }
}
