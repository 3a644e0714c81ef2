//! Single-shot monotonic timers for idle and loss-detection deadlines.
//!
//! The session engine never sleeps; it records deadlines and the owning
//! endpoint loop polls [`Timer::expired`] / [`Timer::deadline`] to decide
//! when to call back in. Updating an armed timer replaces its deadline.

use std::time::{Duration, Instant};

/// Floor applied to every computed interval so a deadline already in the
/// past still fires through the event loop rather than synchronously.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

/// A single-shot deadline timer.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) the timer to fire `interval` from `now`. Intervals
    /// below [`MIN_TIMER_INTERVAL`] are clamped up.
    pub fn update(&mut self, now: Instant, interval: Duration) {
        let interval = interval.max(MIN_TIMER_INTERVAL);
        self.deadline = Some(now + interval);
    }

    /// Arm the timer to fire at an absolute expiry, clamping deadlines at or
    /// before `now` to `now + MIN_TIMER_INTERVAL`.
    pub fn update_to(&mut self, now: Instant, expiry: Instant) {
        let interval = expiry.saturating_duration_since(now);
        self.update(now, interval);
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The pending deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if armed and the deadline has passed. Does not disarm; the
    /// caller fires the associated handler and either stops or re-arms.
    pub fn expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_starts_disarmed() {
        let t = Timer::new();
        assert!(!t.is_armed());
        assert!(!t.expired(Instant::now()));
        assert!(t.deadline().is_none());
    }

    #[test]
    fn test_update_replaces_deadline() {
        let now = Instant::now();
        let mut t = Timer::new();
        t.update(now, Duration::from_millis(100));
        let first = t.deadline().unwrap();
        t.update(now, Duration::from_millis(500));
        assert!(t.deadline().unwrap() > first);
    }

    #[test]
    fn test_past_expiry_clamps_to_minimum() {
        let now = Instant::now();
        let mut t = Timer::new();
        t.update_to(now, now - Duration::from_secs(1));
        // Clamped forward: not yet expired at `now`.
        assert!(!t.expired(now));
        assert!(t.expired(now + MIN_TIMER_INTERVAL));
    }

    #[test]
    fn test_stop_disarms() {
        let now = Instant::now();
        let mut t = Timer::new();
        t.update(now, Duration::from_millis(1));
        t.stop();
        assert!(!t.is_armed());
        assert!(!t.expired(now + Duration::from_secs(1)));
    }
}
