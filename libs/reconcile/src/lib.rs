//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Desired state**: What the node should look like (from the config source).
//! - **Current state**: What the node actually looks like (files, units, labels).
//! - **Convergence**: The process of making current match desired.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - A failed pass leaves the persisted baseline untouched, so a retry
//!   starts from the same inputs

use std::fmt;
use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Result of a single reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The pass converged; the next pass runs after the regular sync period.
    Done,

    /// The pass could not make progress yet and wants to run again soon.
    RequeueAfter(Duration),
}

impl Outcome {
    /// Returns true if the pass asked to be requeued.
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::RequeueAfter(_))
    }
}

/// Hex-encoded SHA-256 checksum of a configuration blob.
///
/// Used to detect whether the configuration applied to a node matches the
/// desired one without comparing the documents themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum(String);

impl Checksum {
    /// Compute the checksum of raw bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Get the checksum string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Checksum {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Checksum {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exponential backoff for failed reconciliation passes.
///
/// Mirrors the per-item rate limiting of controller work queues: every
/// consecutive failure doubles the delay up to `max`, a success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure.
    base: Duration,

    /// Upper bound for the delay.
    max: Duration,

    /// Consecutive failures since the last success.
    failures: u32,
}

impl Backoff {
    /// Create a new backoff tracker.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let exponent = self.failures.min(31);
        self.failures = self.failures.saturating_add(1);

        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max);
        delay.min(self.max)
    }

    /// Number of consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Clear failure tracking (on success).
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

/// Error returned by [`until_timeout`].
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The condition never reported success within the bound.
    #[error("condition not met within {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The condition reported a severe error and polling was aborted.
    #[error(transparent)]
    Aborted(E),
}

/// Poll `condition` every `interval` until it returns `Ok(true)` or `timeout`
/// elapses.
///
/// `Ok(false)` means "not yet", an `Err` aborts polling immediately. The
/// condition is always evaluated at least once.
pub async fn until_timeout<F, Fut, E>(
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if condition().await.map_err(PollError::Aborted)? {
            return Ok(());
        }

        let now = Instant::now();
        if now + interval > deadline {
            return Err(PollError::Timeout {
                elapsed: now.duration_since(start),
            });
        }

        debug!(attempt, "Condition not met yet, retrying");
        tokio::time::sleep(interval).await;
    }
}

/// Default period between two passes of a converged node.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Default delay used when a pass waits for an external precondition.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Default delay after the first failed pass.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default upper bound for the failure backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60); // 5 minutes
