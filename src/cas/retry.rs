//! Retry backoff and transient-error classification
//!
//! Delays grow exponentially from a base, capped at a maximum, with a small
//! additive jitter so colliding retries spread out instead of re-colliding.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Failure messages containing any of these are worth retrying
const TRANSIENT_MARKERS: [&str; 4] = ["conflict", "timeout", "temporary", "deadlock"];

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    /// Creates a policy from explicit bounds
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_ratio: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_ratio,
        }
    }

    /// Creates a policy from configuration
    pub fn from_config(config: &crate::config::RetryConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.jitter_ratio)
    }

    /// Delay before the attempt following retry number `retry`
    ///
    /// `base * 2^retry`, capped at the maximum, plus up to `jitter_ratio`
    /// of the capped value.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * 2f64.powi(retry.min(64) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let jittered = capped * (1.0 + jitter_fraction() * self.jitter_ratio);
        Duration::from_secs_f64(jittered)
    }
}

/// Returns true if the error looks like a passing condition worth retrying
///
/// Matches case-insensitively against every message in the error chain, so a
/// transient root cause survives layers of added context.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string().to_lowercase();
        TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker))
    })
}

// Sub-millisecond clock noise is plenty of entropy for spreading retries.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 10_000) / 10_000.0
}
