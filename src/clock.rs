//! Clock ticks used by class-level bookkeeping.
//!
//! The busy-start override needs to know when a `start` was issued relative
//! to "now". Records read time through the [`Clock`] trait so tests can drive
//! it by hand with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic tick in microseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTick(pub u64);

impl ClockTick {
    /// Tick `seconds` after the epoch; negative values clamp to zero.
    pub fn from_secs_f64(seconds: f64) -> Self {
        ClockTick((seconds.max(0.0) * 1_000_000.0).round() as u64)
    }

    /// Tick `seconds` after this one, saturating.
    pub fn add_secs_f64(self, seconds: f64) -> Self {
        ClockTick(self.0.saturating_add(ClockTick::from_secs_f64(seconds).0))
    }

    /// Tick as seconds.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

/// Source of the current tick.
pub trait Clock: Send + Sync {
    /// Current tick.
    fn now(&self) -> ClockTick;
}

/// Wall clock based on [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ClockTick {
        ClockTick(self.epoch.elapsed().as_micros() as u64)
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Clones share the same tick.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock stopped at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump to `tick`.
    pub fn set(&self, tick: ClockTick) {
        self.micros.store(tick.0, Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockTick {
        ClockTick(self.micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_state() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(other.now(), ClockTick(1_500_000));
    }

    #[test]
    fn tick_arithmetic() {
        let t = ClockTick::from_secs_f64(2.0);
        assert_eq!(t.add_secs_f64(0.5), ClockTick(2_500_000));
        assert_eq!(ClockTick::from_secs_f64(-1.0), ClockTick(0));
        assert!((t.as_secs_f64() - 2.0).abs() < 1e-9);
    }
}
