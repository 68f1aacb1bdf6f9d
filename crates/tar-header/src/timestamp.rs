//! Second-and-nanosecond timestamps as stored in headers and PAX records.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A point in time relative to the Unix epoch.
///
/// Header fields only hold whole seconds; PAX records may carry a decimal
/// fraction, e.g. `mtime=1700000000.25`. `nanos` is always in
/// `0..1_000_000_000`, so `-1.5` is stored as `secs = -2, nanos = 500_000_000`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

/// Error parsing a decimal timestamp.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid timestamp: {0:?}")]
pub struct ParseTimestampError(String);

impl Timestamp {
    /// Create a timestamp, carrying excess nanoseconds into seconds.
    #[must_use]
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self {
            secs: secs.saturating_add(i64::from(nanos / NANOS_PER_SEC)),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    /// A whole-second timestamp.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Whole seconds, rounded towards negative infinity.
    #[must_use]
    pub const fn secs(&self) -> i64 {
        self.secs
    }

    /// Sub-second part.
    #[must_use]
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Convert from a [`SystemTime`], including times before the epoch.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(
                i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                d.subsec_nanos(),
            ),
            Err(e) => {
                let d = e.duration();
                let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
                match d.subsec_nanos() {
                    0 => Self::from_secs(-secs),
                    n => Self::new(-secs - 1, NANOS_PER_SEC - n),
                }
            }
        }
    }

    /// Convert to a [`SystemTime`].
    ///
    /// Times the platform can't represent become [`UNIX_EPOCH`].
    #[must_use]
    pub fn to_system_time(&self) -> SystemTime {
        let nanos = Duration::from_nanos(u64::from(self.nanos));
        let secs = Duration::from_secs(self.secs.unsigned_abs());
        let whole = if self.secs >= 0 {
            UNIX_EPOCH.checked_add(secs)
        } else {
            UNIX_EPOCH.checked_sub(secs)
        };
        whole
            .and_then(|t| t.checked_add(nanos))
            .unwrap_or(UNIX_EPOCH)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return write!(f, "{}", self.secs);
        }

        let (sign, whole, frac) = if self.secs < 0 {
            ("-", (self.secs + 1).unsigned_abs(), NANOS_PER_SEC - self.nanos)
        } else {
            ("", self.secs.unsigned_abs(), self.nanos)
        };
        let frac = format!("{frac:09}");
        write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
    }
}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimestampError(s.to_string());

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }

        let secs: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        // anything beyond nanosecond precision is dropped
        let nanos = frac
            .bytes()
            .chain(std::iter::repeat(b'0'))
            .take(9)
            .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));

        Ok(match (negative, nanos) {
            (false, _) => Self::new(secs, nanos),
            (true, 0) => Self::from_secs(-secs),
            (true, n) => Self::new(-secs - 1, NANOS_PER_SEC - n),
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_secs(1234567890).to_string(), "1234567890");
        assert_eq!(Timestamp::new(12, 500_000_000).to_string(), "12.5");
        assert_eq!(Timestamp::new(-2, 500_000_000).to_string(), "-1.5");
        assert_eq!(Timestamp::new(-1, 750_000_000).to_string(), "-0.25");
        assert_eq!(Timestamp::from_secs(-7).to_string(), "-7");
    }

    #[test]
    fn test_parse() {
        assert_eq!("1234567890".parse(), Ok(Timestamp::from_secs(1234567890)));
        assert_eq!("12.5".parse(), Ok(Timestamp::new(12, 500_000_000)));
        assert_eq!("-1.5".parse(), Ok(Timestamp::new(-2, 500_000_000)));
        assert_eq!(
            "1.1234567891".parse(),
            Ok(Timestamp::new(1, 123_456_789))
        );
        assert!("".parse::<Timestamp>().is_err());
        assert!("1e9".parse::<Timestamp>().is_err());
        assert!("-".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_display_parse_agree() {
        for ts in [
            Timestamp::from_secs(0),
            Timestamp::new(1_700_000_000, 123_000_000),
            Timestamp::new(-100, 1),
        ] {
            assert_eq!(ts.to_string().parse(), Ok(ts));
        }
    }

    #[test]
    fn test_system_time() {
        let before = UNIX_EPOCH - Duration::from_millis(1500);
        let ts = Timestamp::from_system_time(before);
        assert_eq!(ts, Timestamp::new(-2, 500_000_000));
        assert_eq!(ts.to_system_time(), before);

        let after = UNIX_EPOCH + Duration::new(10, 7);
        assert_eq!(Timestamp::from(after).to_system_time(), after);
    }

    #[test]
    fn test_system_time_extremes() {
        assert!(Timestamp::from_secs(i64::MIN).to_system_time() <= UNIX_EPOCH);
        assert!(Timestamp::new(i64::MAX, 999_999_999).to_system_time() >= UNIX_EPOCH);
    }
}
