//! Exponential backoff between verification attempts.

use beacon_core::UtcDateTime;
use std::time::Duration;

/// Doubling backoff: the first retry waits the base interval, each further
/// retry doubles it, capped at the maximum.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60 * 60),
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// The wait before the next attempt, given the number of failed
    /// attempts so far.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        if retry_count <= 0 {
            return Duration::ZERO;
        }

        let exponent = (retry_count - 1).min(30) as u32;
        let secs = self
            .base_interval
            .as_secs()
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_interval.as_secs());
        Duration::from_secs(secs)
    }

    /// Whether a domain is due for another verification attempt.
    pub fn is_due(
        &self,
        last_checked_at: Option<UtcDateTime>,
        retry_count: i32,
        now: UtcDateTime,
    ) -> bool {
        let Some(last) = last_checked_at else {
            return true;
        };

        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        now >= last + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(2), Duration::from_secs(7200));
        assert_eq!(policy.delay_for(3), Duration::from_secs(14400));
        // Capped at 24h
        assert_eq!(policy.delay_for(10), Duration::from_secs(86400));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(86400));
    }

    #[test]
    fn test_never_checked_is_due() {
        let policy = BackoffPolicy::default();
        assert!(policy.is_due(None, 0, Utc::now()));
        assert!(policy.is_due(None, 5, Utc::now()));
    }

    #[test]
    fn test_recent_check_is_not_due() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();

        let last = now - chrono::Duration::minutes(10);
        assert!(!policy.is_due(Some(last), 1, now));

        let last = now - chrono::Duration::minutes(61);
        assert!(policy.is_due(Some(last), 1, now));
    }

    #[test]
    fn test_higher_retry_count_waits_longer() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(90);

        // 90 minutes ago: due after 1 failure (1h), not after 2 (2h)
        assert!(policy.is_due(Some(last), 1, now));
        assert!(!policy.is_due(Some(last), 2, now));
    }
}
