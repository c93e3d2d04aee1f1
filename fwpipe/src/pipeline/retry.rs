//! Retry policy with configurable backoff and jitter strategies.
//!
//! The per-stage budget (`retryable`, `max_retries`) lives on
//! [`StageDefinition`]; the delay between attempts is governed by a
//! pipeline-wide [`RetryConfig`].

use crate::core::{FailureKind, StageStatus};
use crate::pipeline::StageDefinition;
use crate::stages::StageResult;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Pipeline-wide configuration for the delay between stage attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that retries immediately.
    #[must_use]
    pub fn immediate() -> Self {
        Self::default()
            .with_base_delay_ms(0)
            .with_backoff(BackoffStrategy::Constant)
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Calculates the delay before retry number `retry` (0-indexed).
    ///
    /// The result never exceeds `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The attempt succeeded; move on.
    Proceed,
    /// Retry after the specified delay.
    Retry(Duration),
    /// The retry budget is spent.
    GiveUp,
    /// The failure bypasses the retry policy.
    NotRetryable,
}

/// Decides what to do after attempt number `attempt` (1-indexed) of `stage`.
///
/// Launch errors, cancellations and hardware failures are never retried,
/// regardless of the stage's `retryable` flag.
#[must_use]
pub fn decide(
    stage: &StageDefinition,
    result: &StageResult,
    attempt: u32,
    config: &RetryConfig,
) -> RetryDecision {
    if result.status == StageStatus::Success {
        return RetryDecision::Proceed;
    }
    if matches!(
        result.failure_kind,
        Some(FailureKind::LaunchError | FailureKind::Cancelled | FailureKind::HardwareUnavailable)
    ) {
        return RetryDecision::NotRetryable;
    }
    if !result.to_error().is_some_and(|e| e.is_retryable()) || !stage.retryable {
        return RetryDecision::NotRetryable;
    }
    if attempt > stage.max_retries {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(config.delay_for(attempt - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stage(retryable: bool, max_retries: u32) -> StageDefinition {
        StageDefinition::new("unit-test", ["make", "test"])
            .with_retry(retryable, max_retries)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.jitter, JitterStrategy::None);
    }

    #[test]
    fn test_delay_exponential() {
        let config = RetryConfig::new().with_base_delay_ms(100);
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let constant = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);
        assert_eq!(config.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..20 {
            assert!(config.delay_for(0) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_immediate_has_no_delay() {
        assert_eq!(RetryConfig::immediate().delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_decide_success_proceeds() {
        let result = StageResult::success("unit-test", 1, 10, String::new());
        assert_eq!(
            decide(&stage(true, 2), &result, 1, &RetryConfig::immediate()),
            RetryDecision::Proceed
        );
    }

    #[test]
    fn test_decide_retries_within_budget() {
        let config = RetryConfig::immediate();
        let failed = StageResult::failure("unit-test", 1, Some(1), 10, String::new());

        assert_eq!(
            decide(&stage(true, 1), &failed, 1, &config),
            RetryDecision::Retry(Duration::ZERO)
        );
        assert_eq!(decide(&stage(true, 1), &failed, 2, &config), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_timeout_is_retryable() {
        let timed_out = StageResult::timeout("hil", 1, Duration::from_secs(1), 1000, String::new());
        assert!(matches!(
            decide(&stage(true, 3), &timed_out, 1, &RetryConfig::immediate()),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn test_decide_non_retryable_stage() {
        let failed = StageResult::failure("build", 1, Some(2), 10, String::new());
        assert_eq!(
            decide(&stage(false, 0), &failed, 1, &RetryConfig::immediate()),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_decide_launch_error_never_retried() {
        let launch = StageResult::launch_error("build", 1, "No such file or directory");
        assert_eq!(
            decide(&stage(true, 5), &launch, 1, &RetryConfig::immediate()),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_decide_cancelled_never_retried() {
        let cancelled = StageResult::cancelled("hil", 1, 50, String::new(), "user abort");
        assert_eq!(
            decide(&stage(true, 5), &cancelled, 1, &RetryConfig::immediate()),
            RetryDecision::NotRetryable
        );
    }
}
