//! Policy objects that guard model calls: pre-checked usage ceilings and an
//! exponential-backoff-with-jitter retry policy.

use std::time::Duration;

use rand::Rng;

use crate::model::LlmError;

/// Optional upper bounds on a single run's resource consumption. Checked
/// *before* the action that would exceed them, so a breach never wastes a
/// call.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageLimits {
    pub max_requests: Option<u32>,
    pub max_total_tokens: Option<u64>,
    pub max_tool_calls: Option<u32>,
}

impl UsageLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = Some(max);
        self
    }

    pub fn with_max_total_tokens(mut self, max: u64) -> Self {
        self.max_total_tokens = Some(max);
        self
    }

    pub fn with_max_tool_calls(mut self, max: u32) -> Self {
        self.max_tool_calls = Some(max);
        self
    }
}

/// Which ceiling was about to be breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UsageLimitKind {
    Requests,
    Tokens,
    ToolCalls,
}

/// Governs retries of a single model call: attempt count, backoff shape, and
/// which [`LlmError`] kinds are worth retrying at all.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay to jitter by, uniformly, in both directions.
    /// `0.0` yields a deterministic delay.
    pub jitter_fraction: f64,
    pub retryable_error_kinds: Vec<LlmErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            retryable_error_kinds: vec![LlmErrorKind::RateLimited, LlmErrorKind::ServerError, LlmErrorKind::NetworkError],
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            retryable_error_kinds: Vec::new(),
            ..Self::default()
        }
    }

    /// The delay to sleep before attempt `k` (0-indexed). Attempt 0 never delays.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// [`Self::delay`] with uniform jitter applied, for actual use before sleeping.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.delay(attempt).as_secs_f64();
        if self.jitter_fraction <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter_fraction;
        let jittered = base + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn is_retryable(&self, error: &LlmError) -> bool {
        self.retryable_error_kinds.contains(&LlmErrorKind::from(error))
    }
}

/// The taxonomy used by [`RetryPolicy::retryable_error_kinds`] — a policy is
/// configured with which *kinds* of failure to retry, independent of the
/// error's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LlmErrorKind {
    RateLimited,
    ServerError,
    NetworkError,
    InvalidApiKey,
    InvalidRequest,
    ContextLengthExceeded,
    ContentFiltered,
    CapabilityNotSupported,
    DecodingError,
}

impl From<&LlmError> for LlmErrorKind {
    fn from(value: &LlmError) -> Self {
        match value {
            LlmError::RateLimited { .. } => Self::RateLimited,
            LlmError::ServerError(_) => Self::ServerError,
            LlmError::NetworkError(_) => Self::NetworkError,
            LlmError::InvalidApiKey => Self::InvalidApiKey,
            LlmError::InvalidRequest(_) => Self::InvalidRequest,
            LlmError::ContextLengthExceeded { .. } => Self::ContextLengthExceeded,
            LlmError::ContentFiltered(_) => Self::ContentFiltered,
            LlmError::CapabilityNotSupported(_) => Self::CapabilityNotSupported,
            LlmError::DecodingError(_) => Self::DecodingError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn delay_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.0,
            retryable_error_kinds: vec![],
        };
        let mut prev = Duration::ZERO;
        for attempt in 0..8 {
            let d = policy.delay(attempt);
            assert!(d >= prev);
            assert!(d <= policy.max_delay);
            prev = d;
        }
    }

    #[test]
    fn only_configured_kinds_are_retryable() {
        let policy = RetryPolicy {
            retryable_error_kinds: vec![LlmErrorKind::RateLimited],
            ..RetryPolicy::default()
        };
        assert!(policy.is_retryable(&LlmError::RateLimited { retry_after: None }));
        assert!(!policy.is_retryable(&LlmError::InvalidApiKey));
    }
}
