//! Reconciliation loop.
//!
//! The loop:
//! - Runs one pass at a time through the [`Controller`]
//! - Waits out the sync period after a converged pass, polling the source
//!   for a new configuration in between
//! - Retries failed passes with exponential backoff
//! - Stops on shutdown or when the agent has to restart itself

use std::time::Duration;

use gardener_reconcile::{Backoff, Outcome, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_SYNC_PERIOD};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between two passes of a converged node.
    pub sync_period: Duration,

    /// Interval between checks for a new configuration.
    pub poll_interval: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_period: DEFAULT_SYNC_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,

    /// The agent's own unit changed; the process exits to be relaunched.
    RestartSelf,
}

/// Drives passes of a [`Controller`] until shutdown.
pub struct Reconciler {
    controller: Controller,
    config: ReconcilerConfig,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(controller: Controller, config: ReconcilerConfig) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            controller,
            config,
            backoff,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Run passes until `shutdown` turns true or a pass asks for a restart.
    ///
    /// A running pass is never interrupted; shutdown is observed between passes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        info!(
            sync_period_secs = self.config.sync_period.as_secs(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting reconciliation loop"
        );

        loop {
            if *shutdown.borrow() {
                info!("Reconciler shutting down");
                return ExitReason::Shutdown;
            }

            let delay = match self.controller.reconcile().await {
                Ok(report) => {
                    self.backoff.reset();
                    debug!(stages = report.stages.len(), outcome = ?report.outcome, "Pass finished");

                    if report.restart_self {
                        info!("Reconciler stopping for self-restart");
                        return ExitReason::RestartSelf;
                    }
                    match report.outcome {
                        Outcome::Done => None,
                        Outcome::RequeueAfter(delay) => Some(delay),
                    }
                }
                Err(e) => {
                    let delay = self.backoff.record_failure();
                    error!(
                        stage = %e.stage,
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in = ?delay,
                        "Reconciliation failed"
                    );
                    Some(delay)
                }
            };

            let next = match delay {
                Some(delay) => sleep_unless_shutdown(delay, &mut shutdown).await,
                None => self.wait_for_next_pass(&mut shutdown).await,
            };
            if !next {
                info!("Reconciler shutting down");
                return ExitReason::Shutdown;
            }
        }
    }

    /// Wait for the sync period, or less if the source has a new config.
    /// Returns false on shutdown.
    async fn wait_for_next_pass(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + self.config.sync_period;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            let nap = self.config.poll_interval.min(deadline - now);
            if !sleep_unless_shutdown(nap, shutdown).await {
                return false;
            }

            match self.controller.has_new_config().await {
                Ok(true) => {
                    info!("New operating system config available");
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Unable to check for a new configuration"),
            }
        }
    }
}

/// Sleep for `duration`. Returns false if shutdown was signalled first.
async fn sleep_unless_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // nobody can signal anymore
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::controller::ControllerSettings;
    use crate::paths::NodePaths;
    use crate::testing::FakeCapabilities;

    fn reconciler(fakes: &FakeCapabilities, shutdown: watch::Sender<bool>) -> Reconciler {
        let controller = Controller::new(
            fakes.capabilities(),
            NodePaths::default(),
            ControllerSettings::default(),
            reqwest::Client::new(),
            shutdown,
        );
        Reconciler::new(controller, ReconcilerConfig::default())
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.sync_period, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let fakes = FakeCapabilities::new();
        let (tx, rx) = watch::channel(false);
        let reconciler = reconciler(&fakes, tx.clone());

        let stop = async {
            tokio::time::sleep(Duration::from_secs(25)).await;
            tx.send_replace(true);
        };
        let (reason, ()) = tokio::join!(reconciler.run(rx), stop);

        assert_eq!(reason, ExitReason::Shutdown);
        // one pass plus two polls of the source
        assert_eq!(fakes.source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_passes_back_off() {
        let fakes = FakeCapabilities::new();
        fakes.source.set("spec: [unterminated");
        let (tx, rx) = watch::channel(false);
        let reconciler = reconciler(&fakes, tx.clone());

        let stop = async {
            // passes at 0s, 1s and 3s; the next one would be at 7s
            tokio::time::sleep(Duration::from_millis(3500)).await;
            let fetches = fakes.source.fetches();
            tx.send_replace(true);
            fetches
        };
        let (reason, fetches) = tokio::join!(reconciler.run(rx), stop);

        assert_eq!(reason, ExitReason::Shutdown);
        assert_eq!(fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_config_cuts_sync_period_short() {
        let fakes = FakeCapabilities::new();
        let (tx, rx) = watch::channel(false);
        let reconciler = reconciler(&fakes, tx.clone());

        let stop = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            fakes.source.set("spec: {}\n");
            // picked up by the poll at 10s, applied right away
            tokio::time::sleep(Duration::from_secs(6)).await;
            let applied = fakes.fs.file("/var/lib/gardener-node-agent/last-applied-osc.yaml");
            tx.send_replace(true);
            applied
        };
        let (reason, applied) = tokio::join!(reconciler.run(rx), stop);

        assert_eq!(reason, ExitReason::Shutdown);
        assert_eq!(applied.as_deref(), Some(&b"spec: {}\n"[..]));
    }
}
