use chrono::{DateTime, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `expires_unix_ms` is no longer in the future.
pub fn is_expired_unix_ms(expires_unix_ms: u64, now_unix_ms: u64) -> bool {
    expires_unix_ms <= now_unix_ms
}

/// Calendar-day key (`YYYY-MM-DD`) for an instant, truncated in UTC.
///
/// Quota counters are keyed by this value; local-time truncation would
/// double-count across timezone boundaries, so UTC is used exclusively.
pub fn day_key_for(instant: DateTime<Utc>) -> String {
    instant.date_naive().to_string()
}

/// Day key for the current instant.
pub fn current_day_key() -> String {
    day_key_for(Utc::now())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn unit_day_key_truncates_in_utc() {
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).single();
        let early = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).single();
        let late = late.expect("valid timestamp");
        let early = early.expect("valid timestamp");
        assert_eq!(day_key_for(late), "2024-03-01");
        assert_eq!(day_key_for(early), "2024-03-02");
    }

    #[test]
    fn unit_day_key_is_stable_within_a_day() {
        let morning = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).single();
        let evening = Utc.with_ymd_and_hms(2024, 7, 15, 23, 59, 59).single();
        let morning = morning.expect("valid timestamp");
        let evening = evening.expect("valid timestamp");
        assert_eq!(day_key_for(morning), day_key_for(evening));
    }
}
