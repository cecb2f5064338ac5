// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-retry
#![deny(unsafe_code)]
//!
//! The Retry Engine: classifies failures as retryable or terminal per the
//! reliability error taxonomy, computes half-jitter exponential backoff
//! delays, and drives the bounded-attempt loop against an end-to-end
//! deadline without ever sleeping past it.

pub mod cancel;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rmcp_reliability_config::RetryConfig;
use rmcp_reliability_error::{ErrorCode, ErrorKind, ReliabilityError};
use tokio::time::Instant;
use tracing::{debug, warn};

use cancel::CancellationToken;

/// Immutable retry policy. Construct from a [`RetryConfig`] via
/// [`RetryPolicy::from_config`], or build one directly for tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            retry_on_timeout: config.retry_on_timeout,
        }
    }

    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Builder for [`RetryPolicy`], mirroring [`RetryConfig`]'s defaults.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryPolicyBuilder {
    #[must_use]
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.policy.max_attempts = value;
        self
    }

    #[must_use]
    pub fn base_delay(mut self, value: Duration) -> Self {
        self.policy.base_delay = value;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, value: Duration) -> Self {
        self.policy.max_delay = value;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, value: f64) -> Self {
        self.policy.backoff_multiplier = value;
        self
    }

    #[must_use]
    pub fn jitter(mut self, value: bool) -> Self {
        self.policy.jitter = value;
        self
    }

    #[must_use]
    pub fn retry_on_timeout(mut self, value: bool) -> Self {
        self.policy.retry_on_timeout = value;
        self
    }

    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Compute the backoff delay before re-issuing `attempt + 1`, where
/// `attempt` is the 1-indexed attempt that just failed.
///
/// `d = min(max_delay, base_delay * backoff_multiplier^(attempt-1))`,
/// then, if `policy.jitter`, multiplied by a uniform factor in
/// `[0.5, 1.5]` (half-jitter) and capped at `max_delay` again so a jittered
/// delay can never exceed the configured ceiling.
#[must_use]
pub fn compute_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let nominal_ms =
        (policy.base_delay.as_millis() as f64) * policy.backoff_multiplier.powi(exponent as i32);
    let capped_ms = nominal_ms.min(policy.max_delay.as_millis() as f64);

    let final_ms = if policy.jitter {
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        (capped_ms * factor).min(policy.max_delay.as_millis() as f64)
    } else {
        capped_ms
    };

    Duration::from_millis(final_ms.max(0.0) as u64)
}

/// Whether `attempt` (1-indexed, the attempt count made so far) has
/// exhausted the policy's attempt budget.
#[must_use]
pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt < policy.max_attempts
}

/// Whether a failure is retryable under `policy`: the error's own
/// classification, downgraded for `Timeout` when `retry_on_timeout` is
/// false.
#[must_use]
pub fn is_retryable(err: &ReliabilityError, policy: &RetryPolicy) -> bool {
    if !err.is_retryable() {
        return false;
    }
    if err.kind() == ErrorKind::Timeout && !policy.retry_on_timeout {
        return false;
    }
    true
}

/// Metadata about a completed (successful) retry sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryMetadata {
    pub attempts: u32,
    pub total_duration: Duration,
}

/// The value produced by a successful [`retry_async`] call, paired with
/// bookkeeping about how many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub metadata: RetryMetadata,
}

/// Drive `body` through the bounded-attempt retry loop: classify each
/// failure as retryable or terminal, back off between attempts, and stop
/// before a delay would sleep past the end-to-end deadline.
///
/// `body(attempt)` performs one underlying send/receive for the given
/// 1-indexed attempt number and must be replayable (safe to call again on
/// a retryable failure). `on_attempt` fires immediately before each call
/// to `body` (the seam the Session Orchestrator uses to stamp a Tracker's
/// `sent` transition); `on_retry` fires once a retry has been decided,
/// before the backoff sleep (the seam for the `retrying` transition).
///
/// `deadline` is the absolute end-to-end deadline for the whole call; a
/// computed backoff delay that would sleep past it produces a terminal
/// [`ErrorKind::Timeout`] instead.
///
/// Each attempt is itself bounded by whatever remains of `deadline` when it
/// is issued (the effective per-attempt wait is `min(timeout_ms,
/// remaining_deadline)`, and since `timeout_ms` is what `deadline` was
/// derived from, that reduces to `remaining_deadline`). An attempt that
/// does not resolve within its share produces [`ErrorCode::TimeoutPerAttempt`],
/// classified retryable or terminal by [`is_retryable`] like any other
/// failure (i.e. governed by `policy.retry_on_timeout`).
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    cancel: &CancellationToken,
    mut body: F,
    mut on_attempt: impl FnMut(u32),
    mut on_retry: impl FnMut(u32, Duration),
) -> Result<RetryOutcome<T>, ReliabilityError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ReliabilityError>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(ReliabilityError::cancelled(
                "retry loop cancelled before attempt was issued",
            ));
        }
        if Instant::now() >= deadline {
            return Err(ReliabilityError::new(
                ErrorCode::TimeoutDeadlineExceeded,
                "end-to-end deadline elapsed before this attempt could be issued",
            )
            .with_detail("attempts", attempt.saturating_sub(1)));
        }

        on_attempt(attempt);
        debug!(attempt, "issuing underlying MCP call");

        let per_attempt_wait = deadline.saturating_duration_since(Instant::now());
        let result = tokio::select! {
            outcome = tokio::time::timeout(per_attempt_wait, body(attempt)) => match outcome {
                Ok(inner) => inner,
                Err(_elapsed) => Err(ReliabilityError::new(
                    ErrorCode::TimeoutPerAttempt,
                    "per-attempt wait exceeded the remaining end-to-end deadline",
                )),
            },
            () = cancel.cancelled() => {
                return Err(ReliabilityError::cancelled(
                    "retry loop cancelled while awaiting the underlying call",
                ));
            }
        };

        match result {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        attempts: attempt,
                        total_duration: start.elapsed(),
                    },
                });
            }
            Err(err) => {
                let retryable = is_retryable(&err, policy);
                let exhausted = !should_retry(policy, attempt);

                if !retryable || exhausted {
                    warn!(
                        attempt,
                        retryable,
                        exhausted,
                        code = err.code().as_str(),
                        "retry loop terminating"
                    );
                    return Err(err.with_detail("attempts", attempt));
                }

                let delay = compute_delay(policy, attempt);
                let now = Instant::now();
                if now + delay >= deadline {
                    return Err(ReliabilityError::new(
                        ErrorCode::TimeoutDeadlineExceeded,
                        "next backoff delay would exceed the end-to-end deadline",
                    )
                    .with_detail("attempts", attempt)
                    .with_source(err));
                }

                on_retry(attempt, delay);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(ReliabilityError::cancelled(
                            "retry loop cancelled during backoff sleep",
                        ));
                    }
                }

                attempt += 1;
            }
        }
    }
}
