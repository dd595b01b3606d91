//! Process signals mapped onto a cancellation token.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere), then cancel `token`.
///
/// Returns early without cancelling if `token` is cancelled by someone else.
#[cfg(unix)]
pub async fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!(signal = "SIGTERM", "graceful shutdown requested"),
        _ = sigint.recv() => info!(signal = "SIGINT", "graceful shutdown requested"),
        _ = token.cancelled() => return Ok(()),
    }
    token.cancel();
    Ok(())
}

#[cfg(not(unix))]
pub async fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!(signal = "ctrl_c", "graceful shutdown requested");
        }
        _ = token.cancelled() => return Ok(()),
    }
    token.cancel();
    Ok(())
}
