use std::time::Duration;

// No subscription attempt is made for COOLDOWN after a failure
pub const COOLDOWN: Duration = Duration::from_secs(3);
// Retries are scheduled RETRY_DELAY after a failure...
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
// ... until more than BACKOFF_AFTER_FAILURES consecutive failures happened,
// after which the delay doubles at each failure, up to MAX_RETRY_DELAY
pub const BACKOFF_AFTER_FAILURES: u32 = 5;
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Delay before retrying after `failures` consecutive failures
pub fn retry_delay(failures: u32) -> Duration {
    if failures <= BACKOFF_AFTER_FAILURES {
        return RETRY_DELAY;
    }
    let ms = 2u64
        .checked_pow(failures - BACKOFF_AFTER_FAILURES)
        .and_then(|factor| factor.checked_mul(1000))
        .unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_RETRY_DELAY)
}
