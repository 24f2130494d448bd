use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler cancelling the returned token on SIGTERM or SIGINT.
///
/// The grid loop and every channel loop watch this token (or a child of it).
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let received = wait_for_signal().await;
        tracing::info!(signal = received, "Shutdown signal received, stopping grid");
        trigger.cancel();
    });

    token
}

async fn wait_for_signal() -> &'static str {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT will stop the grid");
            wait_for_interrupt().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = wait_for_interrupt() => "SIGINT",
    }
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}
