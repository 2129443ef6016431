//! Retry Mechanism
//!
//! Backoff strategy and per-item attempt bookkeeping for work that is retried
//! after a failure, such as referral distribution.

use std::time::Duration;

use crate::config::ReferralConfig;
use crate::types::Timestamp;

/// Retry strategy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Exponential backoff
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 30,
            max_delay_secs: 1_800,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Exponential strategy from the referral worker settings
    pub fn from_referral(config: &ReferralConfig) -> Self {
        Self::Exponential {
            initial_delay_secs: config.retry_initial_delay_secs,
            max_delay_secs: config.retry_max_delay_secs,
            multiplier: 2.0,
        }
    }

    /// Delay before attempt number `attempt + 1`, given `attempt` failures so far
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed { delay_secs } => Duration::from_secs(*delay_secs),
            RetryStrategy::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay = (*initial_delay_secs as f64) * multiplier.powi(exponent);
                let delay = delay.min(*max_delay_secs as f64);
                Duration::from_secs(delay as u64)
            }
        }
    }

    pub fn retries(&self) -> bool {
        !matches!(self, RetryStrategy::None)
    }
}

/// Attempt history of one retried item
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            last_attempt: None,
            last_error: None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, at: Timestamp, error: impl Into<String>) {
        self.attempts += 1;
        self.last_attempt = Some(at);
        self.last_error = Some(error.into());
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_retry_strategy_fixed() {
        let strategy = RetryStrategy::Fixed { delay_secs: 60 };
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(strategy.delay_for_attempt(5), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_strategy_exponential() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_secs: 30,
            max_delay_secs: 1_800,
            multiplier: 2.0,
        };

        assert_eq!(strategy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_secs(120));
        assert_eq!(strategy.delay_for_attempt(10), Duration::from_secs(1_800)); // Capped at max
    }

    #[test]
    fn test_retry_state_exhaustion() {
        let mut state = RetryState::new(2);
        state.record_failure(Utc::now(), "rpc down");
        assert!(!state.is_exhausted());
        state.record_failure(Utc::now(), "rpc down");
        assert!(state.is_exhausted());
        assert_eq!(state.last_error.as_deref(), Some("rpc down"));
    }
}
