//! TOML configuration file.

use logsink_engine::{ConsumerConfig, RetryConfig, SinkConfig};
use logsink_model::{KeyStrategy, PartitionId};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum CliError {
    /// The file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Where records are read from.
    pub log: LogSection,
    /// Where state and documents live.
    pub store: StoreSection,
    /// Consumer loop tuning.
    #[serde(default)]
    pub consumer: ConsumerSection,
    /// Write retry policy.
    #[serde(default)]
    pub retry: RetrySection,
}

/// `[log]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    /// Log directory.
    pub path: PathBuf,
    /// Topic name.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Partitions to consume, one worker each.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<u32>,
}

/// `[store]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Data directory.
    pub path: PathBuf,
    /// Target collection.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// How document keys are derived.
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Fsync every document write.
    ///
    /// Cursors are always fsynced. With this off, an OS crash can lose
    /// documents whose offsets were already committed; they are not
    /// redelivered.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

/// `[consumer]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSection {
    /// Longest a fetch waits for data.
    pub fetch_timeout_ms: u64,
    /// Consecutive log failures tolerated before giving up.
    pub reconnect_attempts: u32,
    /// Consecutive store-side dead letters that stop a worker (0 disables).
    pub systemic_failure_threshold: u32,
    /// Stop once the log has no more data.
    pub stop_when_idle: bool,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 500,
            reconnect_attempts: 10,
            systemic_failure_threshold: 3,
            stop_when_idle: false,
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    /// Total write attempts per record.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap of the exponential delay.
    pub max_delay_ms: u64,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

fn default_topic() -> String {
    "test-topic".to_owned()
}

fn default_partitions() -> Vec<u32> {
    vec![0]
}

fn default_collection() -> String {
    "messages".to_owned()
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Reads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let text = fs::read_to_string(path).map_err(|source| CliError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(text: &str) -> Result<Self, CliError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), CliError> {
        if self.log.partitions.is_empty() {
            return Err(CliError::Invalid("log.partitions must not be empty".into()));
        }
        let unique: BTreeSet<u32> = self.log.partitions.iter().copied().collect();
        if unique.len() != self.log.partitions.len() {
            return Err(CliError::Invalid("log.partitions has duplicates".into()));
        }
        if self.consumer.fetch_timeout_ms == 0 {
            return Err(CliError::Invalid(
                "consumer.fetch_timeout_ms must be at least 1".into(),
            ));
        }
        if self.consumer.reconnect_attempts == 0 {
            return Err(CliError::Invalid(
                "consumer.reconnect_attempts must be at least 1".into(),
            ));
        }
        // The engine checks the rest of the policy when a worker starts.
        Ok(())
    }

    /// Configured partitions, in file order.
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.log.partitions.iter().copied().map(PartitionId).collect()
    }

    /// Write retry policy.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retry.max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_backoff_multiplier(self.retry.backoff_multiplier)
            .with_jitter(self.retry.jitter)
    }

    /// Worker configuration for `partition`.
    ///
    /// Reconnects use the write policy's delays with their own budget.
    pub fn consumer_config(&self, partition: PartitionId, until_idle: bool) -> ConsumerConfig {
        let retry = self.retry_config();
        let mut reconnect = retry.clone();
        reconnect.max_attempts = self.consumer.reconnect_attempts;

        ConsumerConfig::new(partition)
            .with_fetch_timeout(Duration::from_millis(self.consumer.fetch_timeout_ms))
            .with_retry(retry)
            .with_reconnect(reconnect)
            .with_systemic_failure_threshold(self.consumer.systemic_failure_threshold)
            .with_stop_when_idle(self.consumer.stop_when_idle || until_idle)
    }

    /// Sink writer configuration.
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig::new(self.store.collection.clone()).with_key_strategy(self.store.key_strategy)
    }
}
