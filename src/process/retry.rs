//! Pure retry policy helpers

use rand::Rng;
use std::time::Duration;

use crate::core::RetryConfig;

/// Backoff duration before retry attempt number `attempt` (0-based count of
/// already-failed attempts): `initial * multiplier^attempt`, capped at
/// `max_backoff`, with +/-10% uniform jitter. Never returns zero.
pub fn next_backoff(attempt: u32, retry: &RetryConfig) -> Duration {
    let base = retry.initial_backoff.as_secs_f64()
        * retry.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let capped = base.min(retry.max_backoff.as_secs_f64());

    let jittered = capped * rand::thread_rng().gen_range(0.9..=1.1);

    Duration::from_secs_f64(jittered.max(0.001))
}

/// Whether another attempt should be scheduled after `attempt` failures.
/// `max_attempts == 0` means retry forever.
pub fn should_retry(attempt: u32, retry: &RetryConfig) -> bool {
    if !retry.enabled {
        return false;
    }
    if retry.max_attempts == 0 {
        return true;
    }
    attempt < retry.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_config(initial: Duration, max: Duration, multiplier: f64) -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_attempts: 5,
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: multiplier,
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let cfg = retry_config(Duration::from_secs(2), Duration::from_secs(60), 2.0);

        // Attempt 0: ~2s, attempt 1: ~4s, attempt 2: ~8s, within jitter.
        let b0 = next_backoff(0, &cfg).as_secs_f64();
        let b1 = next_backoff(1, &cfg).as_secs_f64();
        let b2 = next_backoff(2, &cfg).as_secs_f64();

        assert!((1.8..=2.2).contains(&b0), "b0 = {}", b0);
        assert!((3.6..=4.4).contains(&b1), "b1 = {}", b1);
        assert!((7.2..=8.8).contains(&b2), "b2 = {}", b2);
        assert!(b1 > b0);
        assert!(b2 > b1);
    }

    #[test]
    fn backoff_capped_at_max() {
        let cfg = retry_config(Duration::from_secs(2), Duration::from_secs(10), 2.0);

        // Attempt 10 would be 2 * 2^10 = 2048s uncapped.
        let b = next_backoff(10, &cfg);
        assert!(b <= Duration::from_secs(11)); // max + 10% jitter
        assert!(b >= Duration::from_secs(9)); // max - 10% jitter
    }

    #[test]
    fn backoff_jitter_varies() {
        let cfg = retry_config(Duration::from_secs(10), Duration::from_secs(60), 2.0);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(next_backoff(0, &cfg));
        }
        assert!(seen.len() > 1, "expected jitter to produce varying values");
    }

    #[test]
    fn backoff_never_zero() {
        let cfg = retry_config(Duration::from_millis(1), Duration::from_millis(1), 1.0);
        assert!(next_backoff(0, &cfg) > Duration::ZERO);
        assert!(next_backoff(100, &cfg) > Duration::ZERO);
    }

    #[test]
    fn disabled_never_retries() {
        let cfg = RetryConfig {
            enabled: false,
            max_attempts: 5,
            ..Default::default()
        };
        assert!(!should_retry(0, &cfg));
        assert!(!should_retry(1, &cfg));
    }

    #[test]
    fn retries_within_limit() {
        let cfg = RetryConfig {
            enabled: true,
            max_attempts: 3,
            ..Default::default()
        };
        assert!(should_retry(0, &cfg));
        assert!(should_retry(1, &cfg));
        assert!(should_retry(2, &cfg));
        assert!(!should_retry(3, &cfg));
        assert!(!should_retry(4, &cfg));
    }

    #[test]
    fn zero_max_attempts_retries_forever() {
        let cfg = RetryConfig {
            enabled: true,
            max_attempts: 0,
            ..Default::default()
        };
        assert!(should_retry(0, &cfg));
        assert!(should_retry(100, &cfg));
        assert!(should_retry(999_999, &cfg));
    }
}
