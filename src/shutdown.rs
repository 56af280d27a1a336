use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
#[cfg(windows)]
use tokio::signal::windows::{ctrl_break, ctrl_c};

/// Cancel `token` when a termination signal arrives
pub async fn handle_signals(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            info!("Cancelling in-flight work");
            token.cancel();
        }
        // Work finished first
        _ = token.cancelled() => {}
    }
}

/// Platform-specific signal handling implementation
#[cfg(unix)]
async fn wait_for_signal() {
    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::interrupt()));
    let (mut sigterm, mut sigint) = match handlers {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal, shutting down");
        }
    }
}

/// Platform-specific signal handling implementation
#[cfg(windows)]
async fn wait_for_signal() {
    let (mut ctrlc, mut ctrlbreak) = match (ctrl_c(), ctrl_break()) {
        (Ok(ctrlc), Ok(ctrlbreak)) => (ctrlc, ctrlbreak),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = ctrlc.recv() => {
            info!("Received Ctrl+C signal, shutting down");
        }
        _ = ctrlbreak.recv() => {
            info!("Received Ctrl+Break signal, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_returns_once_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let task = tokio::spawn(handle_signals(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
