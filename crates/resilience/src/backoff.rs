//! Exponential backoff with symmetric jitter.
//!
//! The delay before retry `attempt` (0-based, the index of the attempt that
//! just failed) is:
//!
//! ```text
//! d = min(base_delay * multiplier^attempt, max_delay)
//! d = clamp(d + d * jitter_factor * uniform(-1, 1), 0, max_delay)   // when jitter is enabled
//! ```
//!
//! The arithmetic runs on whole nanoseconds, so with jitter disabled the
//! result is exact for integral multipliers.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Computes the delay before the next attempt using the thread-local RNG.
#[must_use]
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    compute_backoff_with(policy, attempt, &mut rand::rng())
}

/// Computes the delay before the next attempt, drawing jitter from `rng`.
///
/// Never panics and never exceeds `policy.max_delay()`: a growth term that
/// overflows saturates to the cap.
#[must_use]
pub fn compute_backoff_with<R: Rng>(
    policy: &RetryPolicy,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let max_nanos = duration_nanos(policy.max_delay);
    let delay = exponential_nanos(policy, attempt, max_nanos);

    if !policy.jitter_enabled || policy.jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_nanos(delay);
    }

    let spread = delay as f64 * policy.jitter_factor;
    let offset = spread * rng.random_range(-1.0..=1.0);
    let jittered = (delay as f64 + offset).clamp(0.0, max_nanos as f64);
    Duration::from_nanos(jittered.round() as u64)
}

fn exponential_nanos(policy: &RetryPolicy, attempt: u32, max_nanos: u64) -> u64 {
    let base = duration_nanos(policy.base_delay);
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = base as f64 * policy.multiplier.powi(exponent);

    if !raw.is_finite() || raw >= max_nanos as f64 {
        max_nanos
    } else if raw <= 0.0 {
        0
    } else {
        raw as u64
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
