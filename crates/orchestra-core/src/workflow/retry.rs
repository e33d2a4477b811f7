//! Retry policy for stage attempts.
//!
//! Stateless: the engine asks whether another attempt is allowed and how
//! long to wait before it. Backoff doubles per attempt up to a ceiling.

use std::time::Duration;

use orchestra_types::config::EngineConfig;
use orchestra_types::workflow::StageDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// The policy for `stage`, falling back to engine defaults.
    pub fn for_stage(stage: &StageDefinition, config: &EngineConfig) -> Self {
        Self {
            max_retries: stage.max_retries.unwrap_or(config.default_max_retries),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a retryable failure on `attempt` (1-based) may be retried.
    pub fn should_retry(&self, attempt: u32, retryable: bool) -> bool {
        retryable && attempt < self.max_attempts()
    }

    /// Delay before the attempt that follows `attempt`:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
