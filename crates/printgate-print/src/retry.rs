// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy for failed conversions: exponential backoff with jitter.
//
// Only transient failures (renderer crash, timeout, busy database) are
// retried, and only while the job has attempts left.  Input the renderer
// rejects outright fails on the first attempt.

use std::time::Duration;

use printgate_core::config::WorkerConfig;
use printgate_core::error::PrintgateError;
use printgate_core::types::ErrorClass;
use tracing::{debug, info, warn};

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first run included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each time after.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue; the job becomes claimable after this delay.
    RetryAfter(Duration),
    /// Do not retry: the failure is permanent.
    GiveUp,
    /// The attempt budget is spent.
    Exhausted,
}

/// Classify a conversion failure for retry decisions.
pub fn classify_error(err: &PrintgateError) -> ErrorClass {
    match err {
        PrintgateError::Conversion(detail) => classify_renderer_detail(detail),
        other => other.class(),
    }
}

/// Look at the renderer's diagnostics for signs of unusable input.
fn classify_renderer_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("syntaxerror")
        || lower.contains("undefinedfilename")
        || lower.contains("invalidfileaccess")
        || lower.contains("unsupported")
        || lower.contains("not a valid")
    {
        return ErrorClass::Permanent;
    }

    // Crashes, signals, resource exhaustion, unexplained exits.
    ErrorClass::Transient
}

/// Decide what to do after attempt number `attempts` (1-based) failed.
///
/// `key` identifies the job (its store number); it only picks the jitter.
pub fn should_retry(
    err: &PrintgateError,
    key: u64,
    attempts: u32,
    policy: &RetryPolicy,
) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!("permanent failure: not retrying");
            RetryDecision::GiveUp
        }
        ErrorClass::Transient => {
            if attempts >= policy.max_attempts {
                warn!(attempts, max = policy.max_attempts, "attempt budget exhausted");
                RetryDecision::Exhausted
            } else {
                let delay = compute_delay(key, attempts.saturating_sub(1), policy);
                debug!(attempts, delay_ms = delay.as_millis() as u64, "scheduling retry");
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

/// delay = min(base * 2^retry + jitter, max_delay), jitter in [0, base).
fn compute_delay(key: u64, retry: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << retry.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, key, retry));
    Duration::from_millis(total_ms.min(policy.max_delay.as_millis() as u64))
}

/// Per-job, per-attempt offset in [0, base): jobs that failed at the same
/// moment come back at different times.
fn jitter(base_ms: u64, key: u64, retry: u32) -> u64 {
    mix(key ^ (u64::from(retry) << 32)) % base_ms.max(1)
}

/// SplitMix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    #[test]
    fn crash_is_transient() {
        let err = PrintgateError::Conversion("renderer killed by signal 9".into());
        assert_eq!(classify_error(&err), ErrorClass::Transient);
        assert_eq!(classify_error(&PrintgateError::RenderTimeout(120)), ErrorClass::Transient);
    }

    #[test]
    fn syntax_error_is_permanent() {
        let err = PrintgateError::Conversion(
            "renderer exited with status 1: Error: /syntaxerror in --token--".into(),
        );
        assert_eq!(classify_error(&err), ErrorClass::Permanent);
    }

    #[test]
    fn retry_respects_budget() {
        let err = PrintgateError::Conversion("exit status 1".into());
        let policy = policy(3);
        assert!(matches!(should_retry(&err, 7, 1, &policy), RetryDecision::RetryAfter(_)));
        assert!(matches!(should_retry(&err, 7, 2, &policy), RetryDecision::RetryAfter(_)));
        assert_eq!(should_retry(&err, 7, 3, &policy), RetryDecision::Exhausted);
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let err = PrintgateError::RenderTimeout(5);
        assert_eq!(should_retry(&err, 7, 1, &policy(1)), RetryDecision::Exhausted);
    }

    #[test]
    fn permanent_error_never_retries() {
        let err = PrintgateError::Pdf("document has no pages".into());
        assert_eq!(should_retry(&err, 7, 1, &policy(5)), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_increases_with_attempts() {
        let policy = RetryPolicy::default();
        let d0 = compute_delay(7, 0, &policy);
        let d1 = compute_delay(7, 1, &policy);
        let d2 = compute_delay(7, 2, &policy);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(compute_delay(7, 20, &policy) <= Duration::from_secs(10));
    }

    #[test]
    fn jobs_failing_together_are_spread_out() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        };
        let delays: std::collections::HashSet<Duration> =
            (1..=16u64).map(|job| compute_delay(job, 0, &policy)).collect();
        assert!(delays.len() > 1, "every job got the same delay");
        assert_ne!(compute_delay(1, 0, &policy), compute_delay(2, 0, &policy));

        for delay in &delays {
            assert!(*delay >= Duration::from_millis(1000));
            assert!(*delay < Duration::from_millis(2000));
        }
        // Stable for a given job and attempt.
        assert_eq!(compute_delay(3, 1, &policy), compute_delay(3, 1, &policy));
    }

    #[test]
    fn policy_follows_worker_config() {
        let config = WorkerConfig {
            max_attempts: 7,
            base_backoff_ms: 250,
            max_backoff_secs: 9,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(9));
    }
}
