//! Millisecond-resolution wall-clock helpers
//!
//! Every persisted timestamp in the system (credential expiry, rate-limit
//! reset, session start) is stored as epoch milliseconds, so this is the one
//! place that touches `SystemTime`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// Milliseconds elapsed from `since` until now, saturating at zero if
/// `since` is in the future.
pub fn elapsed_ms_since(since: u64) -> u64 {
    now_ms().saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_plausibly_current() {
        let ms = now_ms();
        // after 2024-01-01 and before the year 2100, generously
        assert!(ms > 1_700_000_000_000);
        assert!(ms < 4_100_000_000_000);
    }

    #[test]
    fn elapsed_ms_since_past_is_positive() {
        let past = now_ms() - 5_000;
        assert!(elapsed_ms_since(past) >= 5_000);
    }

    #[test]
    fn elapsed_ms_since_future_saturates_to_zero() {
        let future = now_ms() + 60_000;
        assert_eq!(elapsed_ms_since(future), 0);
    }
}
