//! Wall-clock helpers for usage bucketing.
//!
//! A bucket is identified by the Unix second at which it closes. A call made at
//! `t` belongs to the first interval boundary `>= t`.

use std::time::Duration;

use ::time::OffsetDateTime;

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// First multiple of `interval` at or after `now`.
///
/// An already aligned `now` is returned unchanged. A zero interval disables
/// bucketing and also returns `now`.
pub fn next_interval_boundary(now: i64, interval: Duration) -> i64 {
    let step = interval.as_secs() as i64;
    if step <= 0 {
        return now;
    }
    let remainder = now.rem_euclid(step);
    if remainder == 0 {
        now
    } else {
        now + (step - remainder)
    }
}

/// Bucket the current instant falls into.
pub fn current_bucket(interval: Duration) -> i64 {
    next_interval_boundary(now_unix(), interval)
}

/// Time left until the next boundary strictly after `now`.
pub fn until_next_boundary(now: i64, interval: Duration) -> Duration {
    let step = interval.as_secs() as i64;
    if step <= 0 {
        return Duration::ZERO;
    }
    let remainder = now.rem_euclid(step);
    Duration::from_secs((step - remainder) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THIRTY: Duration = Duration::from_secs(30);

    #[test]
    fn test_rounds_up_to_boundary() {
        assert_eq!(next_interval_boundary(1_700_000_001, THIRTY), 1_700_000_010);
        assert_eq!(next_interval_boundary(1_700_000_009, THIRTY), 1_700_000_010);
        assert_eq!(next_interval_boundary(1_700_000_011, THIRTY), 1_700_000_040);
    }

    #[test]
    fn test_aligned_instant_is_its_own_bucket() {
        assert_eq!(next_interval_boundary(1_700_000_010, THIRTY), 1_700_000_010);
    }

    #[test]
    fn test_zero_interval() {
        assert_eq!(next_interval_boundary(42, Duration::ZERO), 42);
        assert_eq!(until_next_boundary(42, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_until_next_boundary() {
        assert_eq!(
            until_next_boundary(1_700_000_001, THIRTY),
            Duration::from_secs(9)
        );
        assert_eq!(until_next_boundary(1_700_000_010, THIRTY), THIRTY);
    }

    #[test]
    fn test_current_bucket_is_aligned() {
        let bucket = current_bucket(THIRTY);
        assert_eq!(bucket % 30, 0);
        assert!(bucket >= now_unix() - 30);
    }
}
