//! Rate-limit wait computation.

use std::time::Duration;

use crate::core::types::RetryConfig;

/// Wait before acting on the `event_index`-th rate-limit hit (0-based) of
/// one `execute()` call.
///
/// Exponential: `min(max_delay_ms, base_delay_ms * 2^event_index)`, saturating
/// instead of overflowing. Otherwise the flat `rate_limit_wait_ms`.
pub fn rate_limit_delay(config: &RetryConfig, event_index: u32) -> Duration {
    if !config.exponential_backoff {
        return Duration::from_millis(config.rate_limit_wait_ms);
    }
    let factor = 2u64.checked_pow(event_index).unwrap_or(u64::MAX);
    let delay = config
        .base_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);
    Duration::from_millis(delay)
}
