//! Simulation clock for the Tellus world.
//!
//! The clock is the single source of truth for simulated time. It holds
//! the tick counter, the number of simulated hours elapsed since the
//! world began, and the calendar epoch those hours are counted from.
//!
//! # Design Principles
//!
//! - The tick counter uses checked arithmetic (no silent overflow).
//! - A step is computed with [`SimClock::next_step`] and committed with
//!   [`SimClock::commit`], so the world can refuse a bad `dt` before any
//!   subsystem runs and then advance exactly once.
//! - Calendar instants are derived from the epoch and hours, never from the
//!   host's wall clock, so replays produce identical timestamps.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

/// Milliseconds in one simulated hour.
const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Tick counter would overflow.
    #[error("tick counter overflow: cannot advance beyond u64::MAX")]
    TickOverflow,

    /// The requested step is negative or not a finite number.
    #[error("invalid time step: {dt} hours")]
    InvalidStep {
        /// The rejected step.
        dt: f64,
    },

    /// The configured epoch year has no valid January 1st.
    #[error("invalid epoch year: {year}")]
    InvalidEpoch {
        /// The rejected year.
        year: i32,
    },
}

/// A validated, not yet committed, clock advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockStep {
    /// Tick the clock will hold after the step.
    pub tick: u64,
    /// Simulation hours after the step.
    pub hours: f64,
    /// Hours covered by the step.
    pub dt: f64,
}

/// Tick counter plus simulated hours.
#[derive(Debug, Clone, PartialEq)]
pub struct SimClock {
    tick: u64,
    hours: f64,
    epoch: DateTime<Utc>,
}

impl SimClock {
    /// A clock at tick 0, hour 0.
    pub const fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            tick: 0,
            hours: 0.0,
            epoch,
        }
    }

    /// Rebuild a clock from persisted values.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidStep`] if `hours` is negative or not
    /// finite.
    pub fn from_parts(tick: u64, hours: f64, epoch: DateTime<Utc>) -> Result<Self, ClockError> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(ClockError::InvalidStep { dt: hours });
        }
        Ok(Self { tick, hours, epoch })
    }

    /// Midnight UTC on January 1st of `year`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidEpoch`] if chrono cannot represent it.
    pub fn epoch_for_year(year: i32) -> Result<DateTime<Utc>, ClockError> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
            .single()
            .ok_or(ClockError::InvalidEpoch { year })
    }

    /// Compute the step for advancing by `dt` hours without applying it.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidStep`] for a negative or non-finite
    /// `dt` (or one that would overflow the hour count), and
    /// [`ClockError::TickOverflow`] if the tick counter is exhausted.
    pub fn next_step(&self, dt: f64) -> Result<ClockStep, ClockError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ClockError::InvalidStep { dt });
        }
        let hours = self.hours + dt;
        if !hours.is_finite() {
            return Err(ClockError::InvalidStep { dt });
        }
        let tick = self.tick.checked_add(1).ok_or(ClockError::TickOverflow)?;
        Ok(ClockStep { tick, hours, dt })
    }

    /// Apply a step produced by [`next_step`](Self::next_step).
    pub const fn commit(&mut self, step: ClockStep) {
        self.tick = step.tick;
        self.hours = step.hours;
    }

    /// Validate and apply a step in one call.
    ///
    /// # Errors
    ///
    /// See [`next_step`](Self::next_step).
    pub fn advance(&mut self, dt: f64) -> Result<u64, ClockError> {
        let step = self.next_step(dt)?;
        self.commit(step);
        Ok(self.tick)
    }

    /// Current tick.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulation hours elapsed.
    pub const fn hours(&self) -> f64 {
        self.hours
    }

    /// The calendar instant hour 0 corresponds to.
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// The calendar instant of the current hour count.
    pub fn now(&self) -> DateTime<Utc> {
        self.instant_at(self.hours)
    }

    /// The calendar instant `hours` after the epoch, to the millisecond.
    ///
    /// Saturates at the epoch if the offset is not representable.
    #[allow(clippy::cast_possible_truncation)]
    pub fn instant_at(&self, hours: f64) -> DateTime<Utc> {
        let millis = (hours * MILLIS_PER_HOUR).round();
        if !millis.is_finite() || millis.abs() >= 9.0e15 {
            return self.epoch;
        }
        TimeDelta::try_milliseconds(millis as i64)
            .and_then(|offset| self.epoch.checked_add_signed(offset))
            .unwrap_or(self.epoch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        SimClock::epoch_for_year(1000).unwrap()
    }

    #[test]
    fn starts_at_zero() {
        let clock = SimClock::new(epoch());
        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.hours(), 0.0);
        assert_eq!(clock.now(), epoch());
    }

    #[test]
    fn advances_tick_and_hours_once() {
        let mut clock = SimClock::new(epoch());
        assert_eq!(clock.advance(1.5).unwrap(), 1);
        assert_eq!(clock.advance(0.0).unwrap(), 2);
        assert_eq!(clock.hours(), 1.5);
        assert_eq!(clock.now(), epoch() + TimeDelta::minutes(90));
    }

    #[test]
    fn rejects_bad_steps_without_change() {
        let mut clock = SimClock::new(epoch());
        for dt in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                clock.advance(dt),
                Err(ClockError::InvalidStep { .. })
            ));
        }
        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.hours(), 0.0);
    }

    #[test]
    fn next_step_does_not_mutate() {
        let clock = SimClock::new(epoch());
        let step = clock.next_step(2.0).unwrap();
        assert_eq!(step.tick, 1);
        assert_eq!(step.hours, 2.0);
        assert_eq!(clock.tick(), 0);
    }

    #[test]
    fn tick_overflow_is_an_error() {
        let mut clock = SimClock::from_parts(u64::MAX, 0.0, epoch()).unwrap();
        assert!(matches!(clock.advance(1.0), Err(ClockError::TickOverflow)));
    }

    #[test]
    fn from_parts_rejects_negative_hours() {
        assert!(SimClock::from_parts(3, -0.5, epoch()).is_err());
        let clock = SimClock::from_parts(3, 24.0, epoch()).unwrap();
        assert_eq!(clock.now(), epoch() + TimeDelta::days(1));
    }
}
