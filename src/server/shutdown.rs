//! Process stop for the agent and the orchestrator
//!
//! Each binary owns one `ShutdownController`. The HTTP listener, the probe
//! loops and the monitor coordinator hold `ShutdownSignal` clones and exit once
//! a stop reason is set. The first reason wins; dropping the controller also
//! releases every waiter.

use tokio::sync::watch;
use tracing::info;

type StopReason = Option<&'static str>;

#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<StopReason>,
}

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        // Err means the controller is gone
        let _ = self.receiver.wait_for(Option::is_some).await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Why the process is stopping, once it is
    pub fn reason(&self) -> StopReason {
        *self.receiver.borrow()
    }

    /// Owned variant of `wait`, for `with_graceful_shutdown`
    pub async fn cancelled(mut self) {
        self.wait().await
    }
}

pub struct ShutdownController {
    sender: watch::Sender<StopReason>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        self.shutdown_because("requested");
    }

    pub fn shutdown_because(&self, reason: &'static str) {
        let first = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            info!(reason, "stopping");
        }
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(None);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Resolve with the name of the first SIGTERM or SIGINT
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
