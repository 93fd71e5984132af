//! Saga timing, retry and event routing settings.

use std::time::Duration;

use redemption_store::outbox::DEFAULT_MAX_RETRIES;

/// Bounded exponential backoff for transient step failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy that retries `max_attempts - 1` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// Doubles per attempt, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(2))
    }
}

/// Destination topics for the outbox events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopics {
    pub requested: String,
    pub completed: String,
    pub failed: String,
}

impl Default for EventTopics {
    fn default() -> Self {
        Self {
            requested: "redemption.requested.v1".to_string(),
            completed: "redemption.completed.v1".to_string(),
            failed: "redemption.failed.v1".to_string(),
        }
    }
}

/// Settings for [`RedemptionCoordinator`](crate::RedemptionCoordinator).
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Upper bound for the forward part of a saga. Compensation is not
    /// counted against it.
    pub saga_timeout: Duration,
    /// Deadline for a single collaborator call.
    pub step_timeout: Duration,
    /// Retries for catalog, ledger reserve and partner calls.
    pub step_retry: RetryPolicy,
    /// Retries for the points reversal.
    pub compensation_retry: RetryPolicy,
    pub topics: EventTopics,
    /// Delivery attempts before an outbox entry is parked.
    pub outbox_max_retries: i32,
}

impl SagaConfig {
    pub fn with_saga_timeout(mut self, timeout: Duration) -> Self {
        self.saga_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_step_retry(mut self, policy: RetryPolicy) -> Self {
        self.step_retry = policy;
        self
    }

    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = policy;
        self
    }

    pub fn with_topics(mut self, topics: EventTopics) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_outbox_max_retries(mut self, max_retries: i32) -> Self {
        self.outbox_max_retries = max_retries;
        self
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(5),
            step_retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::new(
                5,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            topics: EventTopics::default(),
            outbox_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}
