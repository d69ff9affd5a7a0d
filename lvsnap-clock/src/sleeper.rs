//! Sleep abstraction for bounded retry backoff.
//!
//! The only retry in lvsnap is the device lookup after snapshot creation;
//! it waits through a `Sleeper` so tests can assert the backoff schedule
//! without actually waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blocks the current thread between retry attempts.
pub trait Sleeper: Send + Sync {
    fn sleep_ms(&self, millis: u64);
}

/// Sleeper backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSleeper;

impl RealSleeper {
    pub fn new() -> Self {
        Self
    }
}

impl Sleeper for RealSleeper {
    fn sleep_ms(&self, millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }
}

/// Returns immediately and remembers every requested delay.
///
/// Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct MockSleeper {
    calls: Arc<Mutex<Vec<u64>>>,
}

impl MockSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Sum of all requested delays in milliseconds.
    pub fn total_ms(&self) -> u64 {
        self.calls().iter().sum()
    }
}

impl Sleeper for MockSleeper {
    fn sleep_ms(&self, millis: u64) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(millis);
        }
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep_ms(&self, millis: u64) {
        (**self).sleep_ms(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_sleeper_returns_immediately() {
        let sleeper = MockSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep_ms(60_000);
        assert!(start.elapsed().as_millis() < 100);
    }

    #[test]
    fn test_mock_sleeper_records_calls() {
        let sleeper = MockSleeper::new();
        sleeper.sleep_ms(100);
        sleeper.sleep_ms(200);
        assert_eq!(sleeper.calls(), vec![100, 200]);
        assert_eq!(sleeper.total_ms(), 300);
    }

    #[test]
    fn test_mock_sleeper_clones_share_record() {
        let sleeper = MockSleeper::new();
        let clone = sleeper.clone();
        clone.sleep_ms(5);
        assert_eq!(sleeper.calls(), vec![5]);
    }

    #[test]
    fn test_real_sleeper_short_sleep() {
        let start = std::time::Instant::now();
        RealSleeper::new().sleep_ms(1);
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_sleeper_trait_object() {
        let sleeper: Box<dyn Sleeper> = Box::new(MockSleeper::new());
        sleeper.sleep_ms(1);
    }
}
