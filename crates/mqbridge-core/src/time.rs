//! Time values expressed as second/nanosecond pairs.
//!
//! Configuration surfaces express durations as `{ sec, nanosec }`. A zero or
//! negative value means "no deadline" wherever the value is used as a wait
//! timeout.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{CoreError, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A second/nanosecond pair as found in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Time {
    pub sec: i64,
    pub nanosec: i64,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nanosec: 0 };
    pub const INFINITE: Time = Time { sec: -1, nanosec: 0 };

    pub const fn new(sec: i64, nanosec: i64) -> Self {
        Self { sec, nanosec }
    }

    pub fn from_secs(sec: i64) -> Self {
        Self { sec, nanosec: 0 }
    }

    /// Fold whole seconds out of `nanosec` so that `0 <= nanosec < 1e9`.
    pub fn normalize(self) -> Result<Self> {
        let overflow = CoreError::TimeOverflow {
            sec: self.sec,
            nanosec: self.nanosec,
        };
        let carry = self.nanosec.div_euclid(NANOS_PER_SEC);
        let nanosec = self.nanosec.rem_euclid(NANOS_PER_SEC);
        let sec = self.sec.checked_add(carry).ok_or(overflow)?;
        Ok(Self { sec, nanosec })
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nanosec == 0
    }

    pub fn is_infinite(&self) -> bool {
        self.sec < 0
    }

    /// Whole seconds, rounding any fraction up.
    pub fn to_seconds(self) -> Result<u64> {
        let t = self.normalize()?;
        if t.sec < 0 {
            return Err(CoreError::InvalidValue {
                what: "seconds",
                value: format!("{}s", t.sec),
            });
        }
        Ok(t.sec as u64 + u64::from(t.nanosec > 0))
    }

    /// Duration for configuration fields where zero means "no deadline".
    /// Negative values map to zero.
    pub fn to_duration(self) -> Result<Duration> {
        let t = self.normalize()?;
        if t.sec < 0 {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::new(t.sec as u64, t.nanosec as u32))
    }

    /// Interpret the value as a wait timeout.
    pub fn to_timeout(self) -> Result<Timeout> {
        let t = self.normalize()?;
        if t.sec < 0 || t.is_zero() {
            return Ok(Timeout::Infinite);
        }
        Ok(Timeout::After(Duration::new(t.sec as u64, t.nanosec as u32)))
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        Self {
            sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nanosec: i64::from(d.subsec_nanos()),
        }
    }
}

/// Bound on a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until signalled.
    Infinite,
    /// Give up after the duration elapses.
    After(Duration),
}

impl Timeout {
    /// A zero duration means no deadline.
    pub fn from_duration(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::Infinite
        } else {
            Timeout::After(d)
        }
    }

    pub fn deadline_from(&self, start: Instant) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => start.checked_add(*d),
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::from_duration(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_nanoseconds() {
        let t = Time::new(1, 2_500_000_000).normalize().unwrap();
        assert_eq!(t, Time::new(3, 500_000_000));

        let t = Time::new(2, -1).normalize().unwrap();
        assert_eq!(t, Time::new(1, 999_999_999));
    }

    #[test]
    fn test_normalize_overflow() {
        let t = Time::new(i64::MAX, 1_000_000_000);
        assert!(matches!(t.normalize(), Err(CoreError::TimeOverflow { .. })));
    }

    #[test]
    fn test_zero_and_negative_are_infinite() {
        assert_eq!(Time::ZERO.to_timeout().unwrap(), Timeout::Infinite);
        assert_eq!(Time::INFINITE.to_timeout().unwrap(), Timeout::Infinite);
        assert_eq!(
            Time::new(0, 250_000_000).to_timeout().unwrap(),
            Timeout::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_to_seconds_rounds_up() {
        assert_eq!(Time::new(4, 1).to_seconds().unwrap(), 5);
        assert_eq!(Time::from_secs(10).to_seconds().unwrap(), 10);
        assert!(Time::INFINITE.to_seconds().is_err());
    }

    #[test]
    fn test_timeout_from_duration() {
        assert_eq!(Timeout::from_duration(Duration::ZERO), Timeout::Infinite);
        let start = Instant::now();
        let timeout = Timeout::from(Duration::from_secs(1));
        assert_eq!(timeout.deadline_from(start), Some(start + Duration::from_secs(1)));
        assert_eq!(Timeout::Infinite.deadline_from(start), None);
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(Time::new(1, 1_500_000_000).to_duration().unwrap(), Duration::from_millis(2500));
        assert_eq!(Time::INFINITE.to_duration().unwrap(), Duration::ZERO);
    }
}
