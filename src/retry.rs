//! Reconnect policy and exponential backoff.
//!
//! This module provides the [`ReconnectPolicy`] type and the
//! [`retry_with_backoff`] helper the connection manager uses to re-establish
//! a broker session after the link drops.
//!
//! Requests themselves are never retried here: a retry is a brand-new call
//! with a fresh correlation id, issued by the caller.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which [`RpcError::is_retryable`](crate::RpcError::is_retryable) holds
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times
//! - Logs each retry attempt with timing information for debugging

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::sleep;

use crate::{Result, RpcError};

/// Background reconnection policy.
///
/// Reconnection follows `Connected → Reconnecting → Connected | Failed`.
/// Every call in flight when the link drops fails with
/// [`RpcError::ConnectionLost`](crate::RpcError::ConnectionLost) regardless
/// of this policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a dropped link. When `false` the client
    /// goes straight to `Failed` and waits for an explicit `connect()`.
    pub enabled: bool,

    /// Total number of session attempts before giving up (at least 1).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each attempt.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    /// Reasonable default reconnect configuration.
    ///
    /// - `enabled`: true
    /// - `max_attempts`: 5
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            enabled: true,
            max_attempts: 5,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        // ---
        if self.max_attempts == 0 {
            return Err(RpcError::InvalidConfig(
                "reconnect max_attempts must be at least 1".into(),
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(RpcError::InvalidConfig(format!(
                "reconnect multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(RpcError::InvalidConfig(
                "reconnect initial_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Run an async operation until it succeeds, backing off between attempts.
///
/// The operation receives the 1-based attempt number. Non-retryable errors
/// cause immediate failure; retryable ones are retried until
/// `policy.max_attempts` attempts have been made.
///
/// # Backoff Algorithm
///
/// - First attempt: immediately
/// - Second attempt: after `initial_delay` (with jitter)
/// - Subsequent attempts: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized reconnects
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    policy: &ReconnectPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    let mut current_delay = policy.initial_delay;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                if attempt >= max_attempts {
                    crate::log_debug!("retry exhausted after {attempt} attempts, last error: {err}");
                    return Err(err);
                }

                let jittered_delay = apply_jitter(current_delay);

                crate::log_debug!(
                    "attempt {attempt}/{max_attempts} failed, waiting {jittered_delay:?} (error: {err})"
                );

                sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(current_delay.as_secs_f64() * policy.multiplier as f64);
                current_delay = next_delay.min(policy.max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            max_attempts,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_no_retry_on_success() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(3), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<i32, RpcError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // ---
        let result = retry_with_backoff(&fast_policy(5), |attempt| async move {
            if attempt < 3 {
                Err(RpcError::Connection("broker still starting".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(3), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::Connection("refused".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RpcError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_non_retryable_error() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(5), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::NotConnected)
            }
        })
        .await;

        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exponential_backoff_timing() {
        // ---
        let policy = ReconnectPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            ..ReconnectPolicy::default()
        };
        let start = Instant::now();

        let _ = retry_with_backoff(&policy, |_| async {
            Err::<(), _>(RpcError::Connection("down".into()))
        })
        .await;

        let elapsed = start.elapsed();

        // Delays (with jitter 0.75x..1.25x): 50ms, 100ms, 200ms
        // Total min: ~262ms, Total max: ~437ms
        assert!(elapsed >= Duration::from_millis(250), "elapsed too short: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "elapsed too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_max_delay_cap() {
        // ---
        let policy = ReconnectPolicy {
            max_attempts: 6,
            multiplier: 10.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..ReconnectPolicy::default()
        };
        let start = Instant::now();

        let _ = retry_with_backoff(&policy, |_| async {
            Err::<(), _>(RpcError::Connection("down".into()))
        })
        .await;

        // 5 waits, each at most ~62ms once capped
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(450), "max_delay cap not working: {elapsed:?}");
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(75), "jitter too low: {jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "jitter too high: {jittered:?}");
        }
    }

    #[test]
    fn test_policy_validation() {
        // ---
        assert!(ReconnectPolicy::default().validate().is_ok());
        assert!(ReconnectPolicy::disabled().validate().is_ok());

        let zero = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(matches!(zero.validate(), Err(RpcError::InvalidConfig(_))));

        let shrinking = ReconnectPolicy {
            multiplier: 0.5,
            ..ReconnectPolicy::default()
        };
        assert!(matches!(shrinking.validate(), Err(RpcError::InvalidConfig(_))));
    }
}
