//! Backoff for network-class failures
//!
//! Delays grow exponentially from the base delay with up to one base delay
//! of random jitter, and are pinned at the cap once reached. Callers retry
//! indefinitely; the cap only bounds the wait between attempts.

use std::time::Duration;

use rand::Rng;

use localsync_core::ports::RemoteError;

/// Delay before retry number `attempt` (0-based)
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.min(31)));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    exponential
        .saturating_add(Duration::from_millis(jitter_ms))
        .min(cap)
}

/// Whether a failed call should be retried with backoff
pub fn is_retryable(err: &RemoteError) -> bool {
    err.is_network()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delay_is_base_plus_jitter() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = backoff_delay(0, base, Duration::from_secs(10));
            assert!(delay >= base && delay <= base * 2);
        }
    }

    #[test]
    fn test_delay_is_pinned_at_cap() {
        let cap = Duration::from_secs(5);
        assert_eq!(backoff_delay(40, Duration::from_millis(100), cap), cap);
        assert_eq!(backoff_delay(u32::MAX, Duration::from_millis(100), cap), cap);
    }

    #[test]
    fn test_only_network_errors_retry() {
        assert!(is_retryable(&RemoteError::Network("timeout".into())));
        assert!(!is_retryable(&RemoteError::response("Unauthorized", "no", None)));
    }
}
