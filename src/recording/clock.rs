// SPDX-License-Identifier: MIT
//! Capture and replay timing.
//!
//! Nothing here owns a thread or a timer. A [`Ticker`] is a deadline that the
//! caller's event loop polls with its own notion of `now`.

use std::time::{Duration, Instant};

use super::error::ReplayError;

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(1000);

/// Replay pacing: the nominal capture interval scaled by a speed multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackClock {
    base_interval: Duration,
    speed: f64,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_INTERVAL)
    }
}

impl PlaybackClock {
    #[must_use]
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            speed: 1.0,
        }
    }

    #[must_use]
    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Changes the speed multiplier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpeed` for a non-finite or non-positive multiplier. The
    /// current speed is kept in that case.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), ReplayError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ReplayError::InvalidSpeed(speed));
        }
        self.speed = speed;
        Ok(())
    }

    /// Real time between two deliveries at the current speed.
    #[must_use]
    pub fn replay_interval(&self) -> Duration {
        // Very small multipliers overflow `Duration`; such a replay never ticks.
        Duration::try_from_secs_f64(self.base_interval.as_secs_f64() / self.speed)
            .unwrap_or(Duration::MAX)
    }
}

/// Periodic deadline polled by an event loop.
///
/// While running, the next deadline is always `anchor + interval`, where the
/// anchor is the last firing (or the start time before the first one).
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    anchor: Option<Instant>,
    due: Option<Instant>,
}

impl Ticker {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            anchor: None,
            due: None,
        }
    }

    /// Arms the ticker; the first firing is one interval after `now`.
    pub fn start(&mut self, now: Instant) {
        self.anchor = Some(now);
        self.due = now.checked_add(self.interval);
    }

    pub fn stop(&mut self) {
        self.anchor = None;
        self.due = None;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.due
    }

    /// Time left until the next deadline, zero if it already passed.
    #[must_use]
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.due.map(|due| due.saturating_duration_since(now))
    }

    /// Replaces the interval and re-anchors the pending deadline on the last
    /// firing. A deadline that would already be in the past fires on the next
    /// poll.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        if let Some(anchor) = self.anchor {
            self.due = anchor.checked_add(interval).map(|due| due.max(now));
        }
    }

    /// Returns `true` once per elapsed deadline.
    ///
    /// Deadlines advance by whole intervals from the previous one. If the loop
    /// fell behind by more than an interval, the schedule restarts from `now`
    /// instead of firing a burst of late ticks.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(due) = self.due else {
            return false;
        };
        if now < due {
            return false;
        }

        match due.checked_add(self.interval) {
            Some(next) if next > now => {
                self.anchor = Some(due);
                self.due = Some(next);
            }
            _ => {
                self.anchor = Some(now);
                self.due = now.checked_add(self.interval);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn replay_interval_scales_with_speed() {
        let mut clock = PlaybackClock::default();
        assert_eq!(clock.replay_interval(), SECOND);

        clock.set_speed(2.0).unwrap();
        assert_eq!(clock.replay_interval(), Duration::from_millis(500));

        clock.set_speed(0.25).unwrap();
        assert_eq!(clock.replay_interval(), Duration::from_secs(4));
    }

    #[test]
    fn invalid_speed_is_rejected_without_clamping() {
        let mut clock = PlaybackClock::default();
        clock.set_speed(4.0).unwrap();

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                clock.set_speed(bad),
                Err(ReplayError::InvalidSpeed(_))
            ));
        }
        assert!((clock.speed() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tiny_speed_saturates() {
        let mut clock = PlaybackClock::default();
        clock.set_speed(1e-300).unwrap();
        assert_eq!(clock.replay_interval(), Duration::MAX);

        let mut ticker = Ticker::new(clock.replay_interval());
        let t0 = Instant::now();
        ticker.start(t0);
        assert!(!ticker.poll(t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn fires_once_per_interval_without_drift() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(SECOND);
        assert!(!ticker.poll(t0));

        ticker.start(t0);
        assert!(!ticker.poll(t0 + Duration::from_millis(999)));
        // Late by 300ms: the next deadline stays on the 1s grid.
        assert!(ticker.poll(t0 + Duration::from_millis(1300)));
        assert!(!ticker.poll(t0 + Duration::from_millis(1300)));
        assert_eq!(ticker.next_due(), Some(t0 + 2 * SECOND));
        assert!(ticker.poll(t0 + 2 * SECOND));
    }

    #[test]
    fn falling_far_behind_does_not_burst() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(SECOND);
        ticker.start(t0);

        let late = t0 + Duration::from_millis(5500);
        assert!(ticker.poll(late));
        assert!(!ticker.poll(late));
        assert_eq!(ticker.next_due(), Some(late + SECOND));
    }

    #[test]
    fn interval_change_reanchors_on_last_firing() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(SECOND);
        ticker.start(t0);
        assert!(ticker.poll(t0 + SECOND));

        ticker.set_interval(Duration::from_millis(250), t0 + Duration::from_millis(1100));
        assert_eq!(ticker.next_due(), Some(t0 + Duration::from_millis(1250)));

        // Growing the interval pushes the deadline out from the same anchor.
        ticker.set_interval(4 * SECOND, t0 + Duration::from_millis(1100));
        assert_eq!(ticker.next_due(), Some(t0 + 5 * SECOND));
    }

    #[test]
    fn interval_change_never_schedules_in_the_past() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(SECOND);
        ticker.start(t0);

        let now = t0 + Duration::from_millis(800);
        ticker.set_interval(Duration::from_millis(500), now);
        assert_eq!(ticker.next_due(), Some(now));
        assert!(ticker.poll(now));
    }

    #[test]
    fn stop_disarms() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(SECOND);
        ticker.start(t0);
        ticker.stop();
        assert!(!ticker.is_running());
        assert_eq!(ticker.time_until_due(t0), None);
        assert!(!ticker.poll(t0 + 10 * SECOND));
    }
}
