//! Engine clock.
//!
//! Due dates, lock expirations and retry intervals are all computed from a
//! [`Clock`] so that tests can move time forward deterministically.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::error::{DomainError, DomainResult};

/// Longest interval the engine schedules with: 10,000 years of 365 days.
pub const MAX_INTERVAL_MS: u64 = 10_000 * 365 * 24 * 60 * 60 * 1_000;

/// `millis` as a duration, rejecting anything above [`MAX_INTERVAL_MS`].
pub fn interval_from_millis(millis: u64) -> DomainResult<Duration> {
    if millis > MAX_INTERVAL_MS {
        return Err(DomainError::validation(format!(
            "interval of {millis}ms exceeds the maximum of {MAX_INTERVAL_MS}ms"
        )));
    }
    i64::try_from(millis)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| DomainError::validation(format!("interval of {millis}ms is out of range")))
}

/// `now + by`, or a validation error when the instant is not representable.
pub fn deadline(now: DateTime<Utc>, by: Duration) -> DomainResult<DateTime<Utc>> {
    now.checked_add_signed(by)
        .ok_or_else(|| DomainError::validation(format!("{now} + {by} is out of the supported time range")))
}

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that can be pinned to an instant or shifted by an offset.
#[derive(Debug, Default)]
pub struct ControlledClock {
    state: Mutex<ClockState>,
}

#[derive(Debug, Default)]
struct ClockState {
    pinned: Option<DateTime<Utc>>,
    offset: Duration,
}

impl ControlledClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned_at(instant: DateTime<Utc>) -> Self {
        let clock = Self::default();
        clock.set_current_time(instant);
        clock
    }

    pub fn set_current_time(&self, instant: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pinned = Some(instant);
        state.offset = Duration::zero();
    }

    /// Move the clock forward (or backward for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.offset += by;
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = ClockState::default();
    }
}

impl Clock for ControlledClock {
    fn now(&self) -> DateTime<Utc> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pinned.unwrap_or_else(Utc::now) + state.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_clock_advances_by_offset() {
        let start = Utc::now();
        let clock = ControlledClock::pinned_at(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));

        clock.set_current_time(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn intervals_above_the_maximum_are_rejected() {
        assert_eq!(interval_from_millis(1_500).unwrap(), Duration::milliseconds(1_500));
        assert!(interval_from_millis(MAX_INTERVAL_MS).is_ok());
        assert!(interval_from_millis(MAX_INTERVAL_MS + 1).is_err());
        assert!(interval_from_millis(u64::MAX).is_err());
    }

    #[test]
    fn deadline_past_the_calendar_is_an_error() {
        let now = Utc::now();
        assert_eq!(deadline(now, Duration::minutes(5)).unwrap(), now + Duration::minutes(5));
        assert!(matches!(deadline(now, Duration::MAX), Err(DomainError::Validation(_))));
    }
}
