//! Utilities to deal with time sources and timestamps.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A source of wall clock and monotonic time.
///
/// The stats core never reads the clock directly. Hosts supply an implementation, which allows
/// tests to control time with [`ManualTimeSource`].
pub trait TimeSource: Send + Sync {
    /// Returns the current wall clock time.
    fn system_time(&self) -> SystemTime;

    /// Returns the current monotonic time.
    fn monotonic_time(&self) -> Instant;
}

/// A [`TimeSource`] backed by the operating system clocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealTimeSource;

impl TimeSource for RealTimeSource {
    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_time(&self) -> Instant {
        Instant::now()
    }
}

/// A [`TimeSource`] that only moves when told to.
///
/// Both clocks start at the time of construction and advance together.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tally_common::{ManualTimeSource, TimeSource};
///
/// let time = ManualTimeSource::new();
/// let start = time.monotonic_time();
/// time.advance(Duration::from_millis(25));
/// assert_eq!(time.monotonic_time() - start, Duration::from_millis(25));
/// ```
#[derive(Debug)]
pub struct ManualTimeSource {
    inner: Mutex<(SystemTime, Instant)>,
}

impl ManualTimeSource {
    /// Creates a new time source frozen at the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((SystemTime::now(), Instant::now())),
        }
    }

    /// Creates a new time source whose wall clock starts at the given unix timestamp.
    pub fn from_timestamp(timestamp: UnixTimestamp) -> Self {
        let system = SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp.as_secs());
        Self {
            inner: Mutex::new((system, Instant::now())),
        }
    }

    /// Moves both clocks forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += duration;
        inner.1 += duration;
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn system_time(&self) -> SystemTime {
        self.inner.lock().0
    }

    fn monotonic_time(&self) -> Instant {
        self.inner.lock().1
    }
}

/// A unix timestamp (full seconds elapsed since 1970-01-01 00:00 UTC).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    /// Creates a unix timestamp from the given number of seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Creates a unix timestamp from the given system time.
    pub fn from_system(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self(duration)
    }

    /// Returns the current timestamp of the given time source.
    pub fn now(time_source: &dyn TimeSource) -> Self {
        Self::from_system(time_source.system_time())
    }

    /// Returns the number of seconds since the UNIX epoch start.
    pub fn as_secs(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnixTimestamp({})", self.as_secs())
    }
}

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_secs().fmt(f)
    }
}

impl std::ops::Add<Duration> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_secs()))
    }
}

impl std::ops::Sub for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration::from_secs(self.0.saturating_sub(rhs.0))
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.as_secs())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Self::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source_advances_both_clocks() {
        let time = ManualTimeSource::from_timestamp(UnixTimestamp::from_secs(1_700_000_000));
        let start = time.monotonic_time();

        time.advance(Duration::from_secs(10));

        assert_eq!(time.monotonic_time() - start, Duration::from_secs(10));
        assert_eq!(
            UnixTimestamp::now(&time),
            UnixTimestamp::from_secs(1_700_000_010)
        );
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = UnixTimestamp::from_secs(100);
        assert_eq!(ts + Duration::from_millis(2500), UnixTimestamp::from_secs(102));
        assert_eq!(UnixTimestamp::from_secs(90) - ts, Duration::ZERO);
        assert_eq!(ts - UnixTimestamp::from_secs(90), Duration::from_secs(10));
    }

    #[test]
    fn test_timestamp_serde() {
        let ts: UnixTimestamp = serde_json::from_str("4711").unwrap();
        assert_eq!(ts, UnixTimestamp::from_secs(4711));
        assert_eq!(serde_json::to_string(&ts).unwrap(), "4711");
        assert_eq!(format!("{ts:?}"), "UnixTimestamp(4711)");
    }
}
