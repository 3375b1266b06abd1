use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Handlers are registered before this returns, so a signal arriving
/// right after startup is not lost. Worker processes reset these handlers
/// when they start and keep the default dispositions.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, cancelling running job");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, cancelling running job");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
