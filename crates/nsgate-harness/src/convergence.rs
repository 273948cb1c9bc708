//! Bounded retry of eventually-true conditions.
//!
//! [`await_condition`] repeatedly samples a predicate at a fixed interval
//! until it holds or a deadline elapses. The deadline also bounds each
//! individual sample: a probe that hangs is cut off at the remaining
//! budget, so the wall-clock cutoff holds even when the probe itself
//! never returns. Cancellation is cooperative — an in-flight probe is
//! dropped at the deadline, not force-terminated.
//!
//! Probe errors come in two kinds: a sample may report "not yet" (the
//! normal case during startup, retried until the deadline) or raise a
//! [`ProbeFault`] (authorization or configuration failure), which aborts
//! the wait immediately — retrying a policy denial cannot succeed.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Deadline and sampling interval for one convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Total wall-clock budget.
    pub timeout: Duration,

    /// Interval between samples.
    pub poll_interval: Duration,
}

impl WaitConfig {
    /// Create a wait configuration.
    #[must_use]
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// A condition that was met before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converged {
    /// Number of samples taken, including the successful one.
    pub attempts: u32,

    /// Time elapsed until success.
    pub waited: Duration,
}

/// A fatal probe failure that makes further sampling pointless.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct ProbeFault {
    /// Why the probe can never succeed.
    pub reason: String,
}

impl ProbeFault {
    /// Create a fault with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Convergence check failures.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The deadline elapsed before the condition held.
    #[error("condition '{predicate}' not met within {waited:?} after {attempts} samples")]
    TimedOut {
        /// Description of the unmet predicate.
        predicate: String,
        /// Number of samples taken.
        attempts: u32,
        /// Total time waited.
        waited: Duration,
    },

    /// A probe raised a fatal fault.
    #[error("condition '{predicate}' aborted: {reason}")]
    Aborted {
        /// Description of the predicate.
        predicate: String,
        /// The fatal reason.
        reason: String,
    },
}

/// Sample `probe` every `poll_interval` until it returns `Ok(true)` or
/// `timeout` elapses.
///
/// # Errors
///
/// Returns [`WaitError::TimedOut`] naming the predicate when the
/// deadline elapses (including when a single sample hangs past it), and
/// [`WaitError::Aborted`] when the probe raises a [`ProbeFault`].
pub async fn await_condition<F, Fut>(
    predicate: &str,
    mut probe: F,
    config: WaitConfig,
) -> Result<Converged, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProbeFault>>,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempts: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::TimedOut {
                predicate: predicate.to_string(),
                attempts,
                waited: started.elapsed(),
            });
        }

        attempts += 1;
        trace!(predicate, attempts, "sampling condition");

        match tokio::time::timeout(remaining, probe()).await {
            Ok(Ok(true)) => {
                let waited = started.elapsed();
                debug!(predicate, attempts, ?waited, "condition met");
                return Ok(Converged { attempts, waited });
            }
            Ok(Ok(false)) => {}
            Ok(Err(fault)) => {
                return Err(WaitError::Aborted {
                    predicate: predicate.to_string(),
                    reason: fault.reason,
                });
            }
            Err(_) => {
                // The sample itself outlived the deadline.
                return Err(WaitError::TimedOut {
                    predicate: predicate.to_string(),
                    attempts,
                    waited: started.elapsed(),
                });
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::TimedOut {
                predicate: predicate.to_string(),
                attempts,
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(config.poll_interval.min(remaining)).await;
    }
}
