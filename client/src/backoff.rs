//! Retry delay shared by both transports

use std::time::Duration;

/// Delay after the first failure
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);

/// Upper bound for any delay
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Exponential backoff: `min(1000 * 2^failures, 30000)` milliseconds.
pub fn backoff(failures: u32) -> Duration {
    let mut delay = INITIAL_BACKOFF;
    for _ in 0..failures {
        if delay >= MAX_BACKOFF {
            break;
        }
        delay *= 2;
    }
    delay.min(MAX_BACKOFF)
}
