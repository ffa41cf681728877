//! Small time helpers used by the statistics and health code.

use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch, as stored in atomic stat fields.
pub fn unix_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// The current wall clock in Unix milliseconds.
pub fn now_millis() -> i64 {
    unix_millis(Utc::now())
}

/// Convert a stored Unix-millisecond stamp back to a wall-clock time.
/// Returns `None` for the zero sentinel used to mean "never".
pub fn from_unix_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_millis() {
        let now = Utc::now();
        let ms = unix_millis(now);
        let back = from_unix_millis(ms).unwrap();
        assert_eq!(back.timestamp_millis(), ms);
    }

    #[test]
    fn zero_means_never() {
        assert!(from_unix_millis(0).is_none());
    }
}
