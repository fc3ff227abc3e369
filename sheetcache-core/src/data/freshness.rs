//! Freshness policy: is a snapshot past its TTL?

use serde::{Deserialize, Serialize};

/// Freshness of a snapshot relative to a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// No snapshot has been committed yet.
    Absent,
    Fresh { age_secs: i64 },
    Expired { age_secs: i64 },
}

impl Freshness {
    /// Absent snapshots count as expired: both demand a refresh.
    pub fn is_expired(self) -> bool {
        !matches!(self, Freshness::Fresh { .. })
    }
}

/// Classify a snapshot timestamp at `now` (all in epoch seconds).
///
/// Expired iff `now - timestamp > ttl_secs`; an age exactly equal to the TTL
/// is still fresh.
pub fn evaluate_at(timestamp: Option<i64>, ttl_secs: u64, now: i64) -> Freshness {
    match timestamp {
        None => Freshness::Absent,
        Some(ts) => {
            let age_secs = now.saturating_sub(ts);
            if i128::from(age_secs) > i128::from(ttl_secs) {
                Freshness::Expired { age_secs }
            } else {
                Freshness::Fresh { age_secs }
            }
        }
    }
}

pub fn is_expired_at(timestamp: Option<i64>, ttl_secs: u64, now: i64) -> bool {
    evaluate_at(timestamp, ttl_secs, now).is_expired()
}

/// [`is_expired_at`] against the wall clock.
pub fn is_expired(timestamp: Option<i64>, ttl_secs: u64) -> bool {
    is_expired_at(timestamp, ttl_secs, now_epoch_secs())
}

/// Current wall-clock time in epoch seconds.
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_is_expired() {
        assert!(is_expired(None, 3600));
        assert!(is_expired_at(None, u64::MAX, 0));
        assert_eq!(evaluate_at(None, 10, 100), Freshness::Absent);
    }

    #[test]
    fn age_equal_to_ttl_is_fresh() {
        assert!(!is_expired_at(Some(1_000), 60, 1_060));
        assert!(is_expired_at(Some(1_000), 60, 1_061));
    }

    #[test]
    fn reports_age() {
        assert_eq!(
            evaluate_at(Some(100), 10, 105),
            Freshness::Fresh { age_secs: 5 }
        );
        assert_eq!(
            evaluate_at(Some(100), 10, 200),
            Freshness::Expired { age_secs: 100 }
        );
    }

    #[test]
    fn future_timestamp_is_fresh() {
        assert!(!is_expired_at(Some(5_000), 0, 4_000));
    }

    #[test]
    fn just_saved_snapshot_is_fresh_on_wall_clock() {
        assert!(!is_expired(Some(now_epoch_secs()), 60));
    }
}
