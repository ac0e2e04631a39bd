//! Retry spacing for outbound RPCs and throttling of repeated failure logs.

/// Delay before retrying a request that has failed `exponent` times.
///
/// A fresh request (exponent 0) is due immediately.
#[inline]
pub fn rpc_backoff_ms(exponent: u32) -> u64 {
    if exponent == 0 {
        return 0;
    }
    1000u64.saturating_mul(1u64 << exponent.min(32))
}

/// Whether a queued request may be sent at `now_ms`.
#[inline]
pub fn is_rpc_due(last_attempt_ms: u64, exponent: u32, now_ms: u64) -> bool {
    now_ms.saturating_sub(last_attempt_ms) >= rpc_backoff_ms(exponent)
}

/// Exponent after another failed attempt, and whether this failure is the
/// one that reached the cap.
#[inline]
pub fn next_backoff_exponent(exponent: u32, cap: u32) -> (u32, bool) {
    if exponent >= cap {
        (cap, false)
    } else {
        let next = exponent + 1;
        (next, next == cap)
    }
}

/// Whether a repeated failure should be logged loudly again.
#[inline]
pub fn should_log_failure(last_logged_ms: u64, now_ms: u64, interval_ms: u64) -> bool {
    last_logged_ms == 0 || now_ms.saturating_sub(last_logged_ms) >= interval_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(rpc_backoff_ms(0), 0);
        assert_eq!(rpc_backoff_ms(1), 2_000);
        assert_eq!(rpc_backoff_ms(2), 4_000);
        assert_eq!(rpc_backoff_ms(8), 256_000);
    }

    #[test]
    fn test_due_respects_window() {
        assert!(is_rpc_due(0, 0, 0));
        assert!(!is_rpc_due(10_000, 2, 13_000));
        assert!(is_rpc_due(10_000, 2, 14_000));
    }

    #[test]
    fn test_exponent_caps_once() {
        assert_eq!(next_backoff_exponent(0, 3), (1, false));
        assert_eq!(next_backoff_exponent(2, 3), (3, true));
        assert_eq!(next_backoff_exponent(3, 3), (3, false));
    }

    #[test]
    fn test_failure_log_throttle() {
        assert!(should_log_failure(0, 5, 600_000));
        assert!(!should_log_failure(1_000, 300_000, 600_000));
        assert!(should_log_failure(1_000, 601_000, 600_000));
    }
}
