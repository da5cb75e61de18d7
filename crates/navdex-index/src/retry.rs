//! Bounded retry with exponential backoff for local file I/O.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default number of attempts for one read or write.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry policy for transient I/O failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum delay between retries (milliseconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_initial_delay() -> u64 { 50 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 2000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Returns the last error together with the number of attempts made.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err((err, attempt));
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt, max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Blocking counterpart of [`retry`], for code already running on a
/// blocking thread (discovery, cache loading).
pub fn retry_blocking<T, E, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, (E, u32)>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err((err, attempt));
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt, max_attempts, err, delay
                );
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 50);
        assert_eq!(policy.max_delay_ms, 2000);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let result: Result<u32, (String, u32)> = retry(&policy, "write", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("transient {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let result: Result<(), (String, u32)> = retry(&policy, "write", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("disk full".to_string())
        })
        .await;

        let (err, attempts) = result.unwrap_err();
        assert_eq!(err, "disk full");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_none_policy_tries_once() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), (&str, u32)> = retry(&RetryPolicy::none(), "write", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope")
        })
        .await;

        assert_eq!(result.unwrap_err().1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_retry_recovers_from_one_failure() {
        let mut calls = 0;
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let result: Result<&str, (String, u32)> = retry_blocking(&policy, "read", || {
            calls += 1;
            if calls == 1 {
                Err("busy".to_string())
            } else {
                Ok("content")
            }
        });

        assert_eq!(result.unwrap(), "content");
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_blocking_retry_gives_up() {
        let mut calls = 0;
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let result: Result<(), (&str, u32)> = retry_blocking(&policy, "read", || {
            calls += 1;
            Err("gone")
        });

        assert_eq!(result.unwrap_err(), ("gone", 2));
        assert_eq!(calls, 2);
    }
}
