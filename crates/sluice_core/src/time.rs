//! Wall-clock timestamps.
//!
//! Used for commit/job metadata and lease deadlines. Ordering guarantees
//! never depend on these values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall clock timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub seconds: u64,
    /// Sub-second nanoseconds
    pub nanos: u32,
}

impl Timestamp {
    /// Maximum nanoseconds per second
    pub const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// Create a new timestamp
    #[must_use]
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Create from milliseconds since the epoch
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            seconds: millis / 1_000,
            nanos: ((millis % 1_000) * 1_000_000) as u32,
        }
    }

    /// Get current timestamp
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }

    /// Convert to milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.seconds * 1_000 + (self.nanos / 1_000_000) as u64
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub fn elapsed_since(&self, earlier: &Timestamp) -> Duration {
        Duration::from_millis(self.as_millis().saturating_sub(earlier.as_millis()))
    }

    /// Add a duration
    #[must_use]
    pub fn add(&self, duration: Duration) -> Self {
        let mut seconds = self.seconds + duration.as_secs();
        let mut nanos = self.nanos + duration.subsec_nanos();

        if nanos >= Self::NANOS_PER_SEC {
            seconds += 1;
            nanos -= Self::NANOS_PER_SEC;
        }

        Self { seconds, nanos }
    }

    /// Render as RFC 3339 in UTC
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::<chrono::Utc>::from_timestamp(self.seconds as i64, self.nanos)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| self.to_string())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        let ts = Timestamp::from_millis(1_500);
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.nanos, 500_000_000);
        assert_eq!(ts.as_millis(), 1_500);
    }

    #[test]
    fn test_elapsed_since() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(3_500);
        assert_eq!(b.elapsed_since(&a), Duration::from_millis(2_500));
        assert_eq!(a.elapsed_since(&b), Duration::ZERO);
    }

    #[test]
    fn test_add_carries_nanos() {
        let ts = Timestamp::new(1, 900_000_000).add(Duration::from_millis(200));
        assert_eq!(ts, Timestamp::new(2, 100_000_000));
    }

    #[test]
    fn test_now_is_monotone_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
    }

    #[test]
    fn test_rfc3339() {
        let ts = Timestamp::new(0, 0);
        assert_eq!(ts.to_rfc3339(), "1970-01-01T00:00:00+00:00");
    }
}
