use anyhow::{Context, Result};
use libgsm::Control;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Translate process signals into orchestrator requests.
///
/// `SIGTERM`/`SIGINT` request shutdown, `SIGUSR1` a forced backup and `SIGUSR2` a forced
/// update. The listener ends once the orchestrator stops receiving.
pub(crate) fn spawn_listener(tx: mpsc::Sender<Control>) -> Result<JoinHandle<()>> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut usr2 = signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;

    Ok(tokio::spawn(async move {
        let mut shutting_down = false;
        loop {
            let request = tokio::select! {
                _ = terminate.recv() => Control::Shutdown,
                _ = interrupt.recv() => Control::Shutdown,
                _ = usr1.recv() => Control::Backup { force: true },
                _ = usr2.recv() => Control::Update { force: true },
            };
            if request == Control::Shutdown {
                if shutting_down {
                    warn!("shutdown already in progress");
                    continue;
                }
                shutting_down = true;
                info!("termination signal received, shutting down");
            } else {
                info!(?request, "manual trigger received");
            }
            if tx.send(request).await.is_err() {
                break;
            }
        }
    }))
}
