//! Retry policy and per-step execution options.

use std::time::Duration;

use kubemanager_core::config::SagaConfig;

/// Bounded exponential backoff without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based) before the next one.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
        }
    }
}

/// Timeout and retry policy attached to one step of a saga definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// The two option profiles steps are assigned: cluster-facing and local.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProfiles {
    /// Cluster API and Helm steps.
    pub remote: StepOptions,
    /// Database-only steps.
    pub local: StepOptions,
}

impl StepProfiles {
    pub fn from_config(config: &SagaConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            backoff_coefficient: config.backoff_coefficient,
        };
        Self {
            remote: StepOptions {
                timeout: Duration::from_secs(config.remote_timeout_secs),
                retry: retry.clone(),
            },
            local: StepOptions {
                timeout: Duration::from_secs(config.local_timeout_secs),
                retry,
            },
        }
    }
}

impl Default for StepProfiles {
    fn default() -> Self {
        Self::from_config(&SagaConfig::default())
    }
}
