//! Configuration for the aggregator
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no
//! file at all) yields a runnable local setup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::ActionType;
use crate::paths;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
    pub store: StoreConfig,
    pub weights: WeightConfig,
    pub logging: LoggingConfig,
}

/// Partitioned log the consumer reads from and the emitter writes to
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Log database path, or `memory` for a process-local log
    pub address: String,
    /// Partition count used when a topic is first created
    pub partitions: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: paths::project::log_db().to_string_lossy().into_owned(),
            partitions: 4,
        }
    }
}

/// What to do with a record that cannot be processed
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PoisonPolicy {
    /// Stop the worker, commit what was processed
    Halt,
    /// Park the record on the dead-letter topic and keep going
    DeadLetter,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub input_topic: String,
    pub poll_timeout_ms: u64,
    pub max_poll_records: usize,
    pub workers: usize,
    pub on_poison: PoisonPolicy,
    pub dead_letter_topic: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "affinity-aggregator".to_string(),
            input_topic: "stats.user-actions.v1".to_string(),
            poll_timeout_ms: 1000,
            max_poll_records: 500,
            workers: 1,
            on_poison: PoisonPolicy::Halt,
            dead_letter_topic: "stats.user-actions.dlq".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub output_topic: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            output_topic: "stats.events-similarity.v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long a writer waits on SQLite's write lock
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: paths::project::store_db(),
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Weight of each action type
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightConfig {
    pub view: f64,
    pub register: f64,
    pub like: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            view: 0.4,
            register: 0.8,
            like: 1.0,
        }
    }
}

impl WeightConfig {
    /// Weights must be finite, positive and strictly increasing VIEW < REGISTER < LIKE
    pub fn validate(&self) -> Result<()> {
        for action in ActionType::all() {
            let weight = self.weight_of(*action);
            if !weight.is_finite() || weight <= 0.0 {
                bail!(
                    "Weight for {} must be a positive finite number (got {})",
                    action,
                    weight
                );
            }
        }
        if !(self.view < self.register && self.register < self.like) {
            bail!(
                "Weights must increase VIEW < REGISTER < LIKE (got {} / {} / {})",
                self.view,
                self.register,
                self.like
            );
        }
        Ok(())
    }

    pub fn weight_of(&self, action: ActionType) -> f64 {
        match action {
            ActionType::View => self.view,
            ActionType::Register => self.register,
            ActionType::Like => self.like,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::load_from_str(&content)
            .with_context(|| format!("Invalid config file: {:?}", path.as_ref()))
    }

    /// Load configuration from string
    pub fn load_from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve the config to use: explicit path, then project, then user level
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        for candidate in [paths::project::config_path(), paths::config_path()] {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;

        if self.broker.address.trim().is_empty() {
            bail!("broker.address must not be empty");
        }
        if self.broker.partitions == 0 {
            bail!("broker.partitions must be at least 1");
        }
        if self.consumer.group_id.trim().is_empty() {
            bail!("consumer.group_id must not be empty");
        }
        if self.consumer.input_topic.trim().is_empty() {
            bail!("consumer.input_topic must not be empty");
        }
        if self.producer.output_topic.trim().is_empty() {
            bail!("producer.output_topic must not be empty");
        }
        if self.consumer.input_topic == self.producer.output_topic {
            bail!("consumer.input_topic and producer.output_topic must differ");
        }
        if self.consumer.workers == 0 {
            bail!("consumer.workers must be at least 1");
        }
        if self.consumer.max_poll_records == 0 {
            bail!("consumer.max_poll_records must be at least 1");
        }
        if self.consumer.poll_timeout_ms == 0 {
            bail!("consumer.poll_timeout_ms must be at least 1");
        }
        if self.consumer.on_poison == PoisonPolicy::DeadLetter
            && self.consumer.dead_letter_topic.trim().is_empty()
        {
            bail!("consumer.on_poison = \"dead-letter\" requires consumer.dead_letter_topic");
        }

        Ok(())
    }
}
