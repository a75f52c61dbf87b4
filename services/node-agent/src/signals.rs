//! Process signals that stop the agent.
//!
//! systemd stops the agent with SIGTERM, a terminal with SIGINT. Both only
//! flip the shutdown channel; the loop finishes its running pass first.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Registered handlers for SIGTERM and SIGINT.
pub struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    /// Register the handlers. From here on the signals no longer kill the
    /// process.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }

    /// Send `true` on `shutdown` once a signal arrives.
    pub async fn forward(mut self, shutdown: watch::Sender<bool>) {
        let name = self.recv().await;
        info!(signal = name, "Received shutdown signal");
        shutdown.send_replace(true);
    }
}
