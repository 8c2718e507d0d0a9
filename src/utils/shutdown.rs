use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on Ctrl-C or SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a signal that
/// arrives afterwards never falls through to the default disposition.
pub fn cancel_on_shutdown_signal(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down gracefully"),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down gracefully"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}
