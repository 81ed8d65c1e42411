//! Microsecond wall-clock timestamps.
//!
//! `Timestamp` is the time type the reactor hands to read callbacks and uses
//! as the major key of the timer map. It is a plain microsecond count since
//! the Unix epoch, so it is totally ordered, trivially copyable, and cheap to
//! stash in an atomic.

use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Wall-clock time with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The zero timestamp; `is_valid()` is false.
    pub const INVALID: Timestamp = Timestamp(0);

    /// Capture the current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(elapsed.as_micros() as i64)
    }

    /// Build from a raw microsecond count since the epoch.
    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    /// Raw microseconds since the epoch.
    #[inline]
    pub const fn micros(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        if self.0 <= earlier.0 {
            Duration::ZERO
        } else {
            Duration::from_micros((self.0 - earlier.0) as u64)
        }
    }

    /// Signed distance to `other` in microseconds.
    #[inline]
    pub const fn micros_until(self, other: Timestamp) -> i64 {
        other.0 - self.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_micros() as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / MICROS_PER_SEC, self.0 % MICROS_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid() {
        assert!(Timestamp::now().is_valid());
        assert!(!Timestamp::INVALID.is_valid());
        assert!(!Timestamp::default().is_valid());
    }

    #[test]
    fn test_ordering() {
        let a = Timestamp::from_micros(1_000);
        let b = Timestamp::from_micros(2_000);
        assert!(a < b);
        assert_eq!(a, Timestamp::from_micros(1_000));
    }

    #[test]
    fn test_add_duration() {
        let a = Timestamp::from_micros(5_000);
        let b = a + Duration::from_millis(2);
        assert_eq!(b.micros(), 7_000);
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::from_micros(1_000);
        let b = Timestamp::from_micros(4_500);
        assert_eq!(b.saturating_duration_since(a), Duration::from_micros(3_500));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn test_display() {
        let t = Timestamp::from_micros(3 * 1_000_000 + 42);
        assert_eq!(t.to_string(), "3.000042");
    }
}
