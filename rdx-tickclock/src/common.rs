//! Contains common, primitive types used across the Tickclock crate.
//!
//! `Bpm` is the only way a tempo enters the system, so every tempo the
//! scheduler holds has already been checked. `TimerHandle` and `SinkId`
//! identify the armed timer and registered sinks respectively.

use crate::error::TickError;
use slotmap::new_key_type;
use std::fmt;
use std::time::Duration;

new_key_type! {
    /// Uniquely identifies a sink registered with a `SinkSet`.
    ///
    /// Keys are never reused, so a stale `SinkId` held after removal cannot
    /// accidentally address a newer sink.
    pub struct SinkId;
}

/// A validated tempo in beats per minute.
///
/// The value is positive and finite, and `60 / bpm` seconds is a non-zero,
/// representable `Duration`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bpm(f64);

impl Bpm {
    /// Validates a raw tempo.
    pub fn new(bpm: f64) -> Result<Self, TickError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(TickError::InvalidTempo(bpm));
        }
        match Duration::try_from_secs_f64(60.0 / bpm) {
            Ok(interval) if !interval.is_zero() => Ok(Self(bpm)),
            _ => Err(TickError::InvalidTempo(bpm)),
        }
    }

    /// The raw beats-per-minute value.
    pub fn get(self) -> f64 {
        self.0
    }

    /// The time between two consecutive beats.
    pub fn interval(self) -> Duration {
        // Checked in `new`.
        Duration::from_secs_f64(60.0 / self.0)
    }
}

impl TryFrom<f64> for Bpm {
    type Error = TickError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for Bpm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BPM", self.0)
    }
}

/// Identifies one armed timer.
///
/// Every arm gets a fresh generation. A firing whose handle does not match
/// the scheduler's pending arm is stale and gets discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) u64);

impl TimerHandle {
    pub fn generation(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_at_common_tempos() {
        assert_eq!(Bpm::new(60.0).unwrap().interval(), Duration::from_secs(1));
        assert_eq!(Bpm::new(120.0).unwrap().interval(), Duration::from_millis(500));
        assert_eq!(Bpm::new(240.0).unwrap().interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_non_positive_and_non_finite() {
        for bad in [0.0, -0.0, -5.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(
                matches!(Bpm::new(bad), Err(TickError::InvalidTempo(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_rejects_unrepresentable_intervals() {
        // 60 / 1e-300 seconds overflows a Duration.
        assert!(Bpm::new(1e-300).is_err());
        // 60 / 1e300 seconds rounds to zero nanoseconds.
        assert!(Bpm::new(1e300).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Bpm::new(90.0).unwrap().to_string(), "90 BPM");
    }
}
