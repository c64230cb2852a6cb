//! [`RetryPolicy`] – how many attempts a task gets and how long it waits
//! between them.
//!
//! A [`RetryRule`] applies to one `task_type`; the policy holds a default
//! rule plus per-type overrides.  After the `n`-th failed attempt the task
//! waits `min(base_backoff · 2^(n-1), max_backoff)` before it is claimable
//! again.  A zero `base_backoff` makes retries immediately eligible.

use std::collections::HashMap;
use std::time::Duration;

/// Default number of attempts per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry limits for one `task_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRule {
    /// Attempts allowed before the task fails terminally.  `0` counts as `1`.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryRule {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryRule {
    /// A rule with `max_retries` attempts and no backoff.
    pub const fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Attempts actually granted.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Whether a task that has failed `retry_count` times gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts()
    }

    /// Delay before the attempt following failure number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_backoff.max(self.base_backoff);
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff.saturating_mul(1u32 << exponent).min(cap)
    }
}

/// Default [`RetryRule`] plus per-`task_type` overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    default: RetryRule,
    overrides: HashMap<String, RetryRule>,
}

impl RetryPolicy {
    pub fn new(default: RetryRule) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, task_type: impl Into<String>, rule: RetryRule) -> Self {
        self.overrides.insert(task_type.into(), rule);
        self
    }

    pub fn default_rule(&self) -> &RetryRule {
        &self.default
    }

    /// Rule governing `task_type`.
    pub fn rule_for(&self, task_type: &str) -> &RetryRule {
        self.overrides.get(task_type).unwrap_or(&self.default)
    }
}
