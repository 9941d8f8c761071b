//! Configuration for the consumer loop and sink writer.

use crate::error::{PipelineError, PipelineResult};
use logsink_model::{KeyStrategy, PartitionId};
use rand::Rng;
use std::time::Duration;

/// Configuration for one partition worker.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Partition to consume.
    pub partition: PartitionId,
    /// Longest a single fetch may wait for a record.
    pub fetch_timeout: Duration,
    /// Backoff for transient store and dead-letter failures.
    pub retry: RetryConfig,
    /// Backoff for transient log failures. `max_attempts` is the reconnect budget.
    pub reconnect: RetryConfig,
    /// Consecutive store-side dead letters that stop the worker (0 disables).
    pub systemic_failure_threshold: u32,
    /// Stop gracefully when a fetch finds no data.
    pub stop_when_idle: bool,
}

impl ConsumerConfig {
    /// Creates a configuration for `partition` with default policies.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            fetch_timeout: Duration::from_millis(500),
            retry: RetryConfig::default(),
            reconnect: RetryConfig::new(10),
            systemic_failure_threshold: 3,
            stop_when_idle: false,
        }
    }

    /// Sets the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the write retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the log reconnect policy.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the systemic failure threshold.
    pub fn with_systemic_failure_threshold(mut self, threshold: u32) -> Self {
        self.systemic_failure_threshold = threshold;
        self
    }

    /// Stops the worker once the log has no more data.
    pub fn with_stop_when_idle(mut self, stop: bool) -> Self {
        self.stop_when_idle = stop;
        self
    }

    /// Checks the configuration for values the loop cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.fetch_timeout.is_zero() {
            return Err(PipelineError::Config(
                "fetch_timeout must be greater than zero".into(),
            ));
        }
        self.retry.validate("retry")?;
        self.reconnect.validate("reconnect")?;
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(PartitionId(0))
    }
}

/// Where and how the sink writer stores documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Target collection.
    pub collection: String,
    /// How document keys are derived.
    pub key_strategy: KeyStrategy,
}

impl SinkConfig {
    /// Creates a sink configuration for `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key_strategy: KeyStrategy::default(),
        }
    }

    /// Sets the key strategy.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::new("messages")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the exponential part of the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay to wait before retry number `retry` (the first retry is 1).
    ///
    /// `initial_delay × multiplier^(retry-1)`, capped at `max_delay`, plus
    /// up to 25% jitter. Retry 0 has no delay.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let delay_secs = if self.add_jitter {
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };

        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }

    fn validate(&self, name: &str) -> PipelineResult<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(format!(
                "{name}.max_attempts must be at least 1"
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PipelineError::Config(format!(
                "{name}.backoff_multiplier must be a finite number >= 1.0"
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(PipelineError::Config(format!(
                "{name}.initial_delay must not exceed {name}.max_delay"
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_config_builder() {
        let config = ConsumerConfig::new(PartitionId(4))
            .with_fetch_timeout(Duration::from_millis(20))
            .with_systemic_failure_threshold(0)
            .with_stop_when_idle(true);

        assert_eq!(config.partition, PartitionId(4));
        assert_eq!(config.fetch_timeout, Duration::from_millis(20));
        assert_eq!(config.systemic_failure_threshold, 0);
        assert!(config.stop_when_idle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sink_config_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.collection, "messages");
        assert_eq!(config.key_strategy, KeyStrategy::EventId);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay3 = config.delay_for_attempt(3);
        assert!(delay3 >= Duration::from_millis(400));
        assert!(delay3 <= Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(80));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250));

        let far = config.delay_for_attempt(u32::MAX);
        assert!(far <= Duration::from_millis(6250));
    }

    #[test]
    fn zero_fetch_timeout_is_rejected() {
        let config = ConsumerConfig::default().with_fetch_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn invalid_retry_configs_are_rejected() {
        let zero = ConsumerConfig::default().with_retry(RetryConfig::new(0));
        assert!(matches!(zero.validate(), Err(PipelineError::Config(_))));

        let shrinking = ConsumerConfig::default()
            .with_reconnect(RetryConfig::new(3).with_backoff_multiplier(0.5));
        assert!(matches!(shrinking.validate(), Err(PipelineError::Config(_))));

        let inverted = ConsumerConfig::default().with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_secs(10))
                .with_max_delay(Duration::from_secs(1)),
        );
        assert!(inverted.validate().is_err());
    }
}
