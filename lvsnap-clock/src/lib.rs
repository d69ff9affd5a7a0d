//! Time abstractions for lvsnap.
//!
//! The lifecycle controller never reads the wall clock or sleeps directly.
//! Both go through the traits here so retention ages, archive timestamps and
//! lookup backoff can be driven deterministically in tests.

pub mod sleeper;

use std::time::{SystemTime, UNIX_EPOCH};

pub use sleeper::{MockSleeper, RealSleeper, Sleeper};

/// Seconds in one day, used to turn retention days into an age threshold.
pub const SECS_PER_DAY: u64 = 86_400;

/// Source of the current Unix time.
pub trait Clock: Send + Sync {
    /// Current time as whole seconds since the Unix epoch.
    fn now_unix_sec(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_sec(&self) -> u64 {
        // A clock set before 1970 collapses to the epoch rather than aborting a backup.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    timestamp: u64,
}

impl MockClock {
    pub fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

impl Clock for MockClock {
    fn now_unix_sec(&self) -> u64 {
        self.timestamp
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_unix_sec(&self) -> u64 {
        (**self).now_unix_sec()
    }
}
