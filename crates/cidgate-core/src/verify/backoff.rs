//! Exponential backoff with uniform jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Deterministic part of the delay before the next attempt:
/// `base * 2^(attempts_made - 1)`, clamped to `[base, max]`.
///
/// `attempts_made` of 0 and 1 both give `base`.
pub fn backoff_delay(attempts_made: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).clamp(base, max.max(base))
}

/// Random jitter in `[0, max]`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Full delay for the retry following `attempts_made` attempts.
pub fn retry_delay(config: &RetryConfig, attempts_made: u32) -> Duration {
    backoff_delay(attempts_made, config.base_delay, config.max_delay) + jitter(config.jitter_max)
}
