//! Time-source abstraction.
//!
//! Production code injects [`SystemClock`], which uses `SystemTime` for
//! wall-clock timestamps and `Instant` for elapsed comparisons. Tests can
//! inject a scripted clock for deterministic behaviour.

use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Abstraction over time sources for testability.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time in microseconds since the UNIX epoch.
    fn now_micros(&self) -> i64;

    /// A monotonic instant for elapsed comparisons.
    fn monotonic_now(&self) -> Instant;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}
