//! Deterministic retry backoff
//!
//! The delay grows exponentially in the number of finished attempts and is
//! capped at one hour. There is no jitter: the delay is a pure function of
//! the attempt count and the heartbeat TTL.

use std::time::Duration;

/// Cap on any single retry delay
pub const MAX_BACKOFF_SECS: u64 = 3600;

/// Floor for the backoff base, applied when the heartbeat TTL is very short
pub const MIN_BASE_SECS: u64 = 5;

/// Delay before the next attempt, given the number of attempts already
/// finished (1-based: `attempts == 1` after the first failure).
///
/// `backoff_seconds = min(base * 2^(attempts - 1), 3600)` with
/// `base = max(heartbeat_ttl_seconds, 5)`.
pub fn retry_delay(attempts: i32, heartbeat_ttl: Duration) -> Duration {
    let base = heartbeat_ttl.as_secs().max(MIN_BASE_SECS);
    let exponent = attempts.saturating_sub(1).max(0) as u32;
    let secs = base
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        let ttl = Duration::from_secs(10);
        assert_eq!(retry_delay(1, ttl), Duration::from_secs(10));
        assert_eq!(retry_delay(2, ttl), Duration::from_secs(20));
        assert_eq!(retry_delay(3, ttl), Duration::from_secs(40));
        assert_eq!(retry_delay(4, ttl), Duration::from_secs(80));
    }

    #[test]
    fn test_base_floor() {
        // TTLs under 5 seconds clamp to a 5 second base
        let ttl = Duration::from_secs(1);
        assert_eq!(retry_delay(1, ttl), Duration::from_secs(5));
        assert_eq!(retry_delay(2, ttl), Duration::from_secs(10));
    }

    #[test]
    fn test_capped_at_one_hour() {
        let ttl = Duration::from_secs(60);
        assert_eq!(retry_delay(30, ttl), Duration::from_secs(MAX_BACKOFF_SECS));
        // Large attempt counts must not overflow
        assert_eq!(retry_delay(i32::MAX, ttl), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_monotonic_until_cap() {
        let ttl = Duration::from_secs(10);
        let mut previous = Duration::ZERO;
        for attempts in 1..=12 {
            let delay = retry_delay(attempts, ttl);
            assert!(delay >= previous, "delay shrank at attempt {attempts}");
            assert!(delay <= Duration::from_secs(MAX_BACKOFF_SECS));
            previous = delay;
        }
    }

    #[test]
    fn test_attempts_below_one_clamp_to_base() {
        assert_eq!(retry_delay(0, Duration::from_secs(10)), Duration::from_secs(10));
        assert_eq!(retry_delay(-3, Duration::from_secs(10)), Duration::from_secs(10));
    }
}
