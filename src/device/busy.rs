//! Busy-start override.
//!
//! Some controllers report idle for a short while after a start command,
//! before the motion or acquisition has actually begun. The class layer
//! records the tick at which every start was issued, and for `interval`
//! seconds afterwards reports busy regardless of what the driver says.

use tracing::warn;

use crate::clock::ClockTick;

/// True if `now` lies within `[start, start + window]`.
///
/// A non-positive window disables the override.
pub fn check_busy_start_interval(start: ClockTick, window_secs: f64, now: ClockTick) -> bool {
    if !(window_secs > 0.0) {
        return false;
    }
    let end = start.add_secs_f64(window_secs);
    now >= start && now <= end
}

/// Busy-start bookkeeping kept on every class struct that can start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BusyStart {
    /// Window length in seconds.
    pub interval: f64,
    /// Tick of the most recent start, if any.
    pub last_start: Option<ClockTick>,
}

impl BusyStart {
    /// Window of `interval` seconds with no start recorded.
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    /// Remember that a start was issued at `tick`.
    pub fn record_start(&mut self, tick: ClockTick) {
        self.last_start = Some(tick);
    }

    /// True while `now` is inside the window opened by the last start.
    pub fn in_window(&self, now: ClockTick) -> bool {
        self.last_start
            .is_some_and(|start| check_busy_start_interval(start, self.interval, now))
    }

    /// Combine the driver's busy report with the start window.
    pub fn apply(&self, record: &str, driver_busy: bool, now: ClockTick) -> bool {
        if driver_busy {
            return true;
        }
        if self.in_window(now) {
            warn!(
                record,
                interval = self.interval,
                "driver reported idle inside the busy-start window; reporting busy"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_inclusive_at_both_ends() {
        let start = ClockTick::from_secs_f64(10.0);
        assert!(check_busy_start_interval(start, 0.5, start));
        assert!(check_busy_start_interval(start, 0.5, start.add_secs_f64(0.5)));
        assert!(!check_busy_start_interval(start, 0.5, start.add_secs_f64(0.500_001)));
    }

    #[test]
    fn ticks_before_start_are_outside() {
        let start = ClockTick::from_secs_f64(10.0);
        assert!(!check_busy_start_interval(start, 1.0, ClockTick::from_secs_f64(9.0)));
    }

    #[test]
    fn zero_window_disables_override() {
        let start = ClockTick::from_secs_f64(1.0);
        assert!(!check_busy_start_interval(start, 0.0, start));
        assert!(!check_busy_start_interval(start, -1.0, start));
    }

    #[test]
    fn driver_busy_passes_through() {
        let busy = BusyStart::new(0.0);
        assert!(busy.apply("m1", true, ClockTick(0)));
        assert!(!busy.apply("m1", false, ClockTick(0)));
    }
}
