//! # Traits - Seams Between ORACLE and its Host
//!
//! The engine never reads wall-clock time directly. Record timestamps and
//! KNN recency come from an injected `Clock`, so a test can drive time
//! tick by tick and get the same answer every run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of logical time in milliseconds
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> u64;

    /// Name of this clock (for logging)
    fn name(&self) -> &'static str;
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct LogicalClock {
    now: AtomicU64,
}

impl LogicalClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward, returning the new time
    pub fn advance(&self, millis: u64) -> u64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "logical"
    }
}

/// Milliseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_clock() {
        let clock = LogicalClock::new(100);
        assert_eq!(clock.now(), 100);
        assert_eq!(clock.advance(16), 116);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 0);
    }
}
