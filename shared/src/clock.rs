//! Local millisecond clocks
//!
//! Each robot runs its own free-running clock. Only rate and monotonicity
//! matter; values carry no wall-clock meaning.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond counter local to one device
pub trait Clock: Send + Sync {
    /// Milliseconds since the clock was started. Never decreases.
    fn now_ms(&self) -> u32;
}

/// Clock backed by the host's monotonic timer
///
/// Clones share the same epoch, so every task on a device reads one timeline.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Start a new clock at zero
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // A 32-bit millisecond counter lasts ~49 days; saturate instead of wrapping
        u32::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u32::MAX)
    }
}

/// Hand-driven clock for simulations and tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(start_ms)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `ms`; ignored if it would move the clock backwards
    pub fn set(&self, ms: u32) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_decreases() {
        let clock = MonotonicClock::start();
        let mut last = clock.now_ms();
        for _ in 0..1000 {
            let now = clock.now_ms();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_monotonic_clones_share_epoch() {
        let clock = MonotonicClock::start();
        let copy = clock;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let a = clock.now_ms();
        let b = copy.now_ms();
        assert!(a >= 5 && b >= 5);
        assert!(a.abs_diff(b) <= 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        let shared = clock.clone();
        clock.advance(19);
        assert_eq!(shared.now_ms(), 1019);

        // Never goes backwards
        clock.set(10);
        assert_eq!(clock.now_ms(), 1019);
        clock.set(1020);
        assert_eq!(shared.now_ms(), 1020);
    }
}
