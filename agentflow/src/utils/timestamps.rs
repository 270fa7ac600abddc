//! Timestamp helpers shared by state snapshots, ledgers and checkpoints.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 string with microseconds.
///
/// # Examples
///
/// ```
/// use agentflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Formats a timestamp the same way [`iso_timestamp`] does.
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Time elapsed since `since`, clamped at zero for clock skew.
#[must_use]
pub fn age_of(since: &Timestamp) -> Duration {
    (Utc::now() - *since).to_std().unwrap_or(Duration::ZERO)
}

/// Milliseconds between two timestamps, clamped at zero.
#[must_use]
pub fn millis_between(start: &Timestamp, end: &Timestamp) -> u64 {
    u64::try_from((*end - *start).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-15T10:30:00.000000+00:00");
    }

    #[test]
    fn test_millis_between_clamps() {
        let a = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert_eq!(millis_between(&a, &b), 1500);
        assert_eq!(millis_between(&b, &a), 0);
    }

    #[test]
    fn test_age_of_future_is_zero() {
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(age_of(&future), Duration::ZERO);
    }
}
