//! Partitioned, offset-addressable log
//!
//! The aggregator never talks to a concrete broker. It needs:
//! - append a keyed record to a topic (partition chosen from the key)
//! - fetch records of one partition from an offset
//! - read and write a consumer group's committed offsets
//!
//! Two implementations ship: [`MemoryBroker`] (process-local, tests) and
//! [`SqliteBroker`] (a durable log file shared between processes).

pub mod consumer;
pub mod memory;
pub mod sqlite;

pub use consumer::{LogConsumer, Poll};
pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Broker address that selects the in-process log
pub const MEMORY_ADDRESS: &str = "memory";

/// A topic partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Partition → next offset to consume
pub type OffsetMap = BTreeMap<TopicPartition, u64>;

/// One record read from a partition
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: i64,
    pub payload: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Where an appended record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
}

/// Partitioned log operations the pipeline relies on
pub trait Broker: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create the topic if missing; returns its partition count
    fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<u32>;

    /// Partition count, `None` if the topic does not exist
    fn partition_count(&self, topic: &str) -> Result<Option<u32>>;

    /// Append a record; the partition is derived from `key`
    fn append(&self, topic: &str, key: i64, payload: &[u8]) -> Result<RecordPosition>;

    /// Up to `max_records` records of one partition starting at `from`
    fn fetch(&self, tp: &TopicPartition, from: u64, max_records: usize) -> Result<Vec<LogRecord>>;

    /// Offset the next appended record of the partition will get
    fn end_offset(&self, tp: &TopicPartition) -> Result<u64>;

    /// Committed next-offset of a consumer group
    fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<u64>>;

    /// Durably record a consumer group's positions
    fn commit(&self, group_id: &str, offsets: &OffsetMap) -> Result<()>;
}

/// Partition for a record key (keys hash by value, negative keys included)
pub fn partition_for_key(key: i64, partitions: u32) -> u32 {
    key.rem_euclid(i64::from(partitions.max(1))) as u32
}

/// Open the broker named by a config address
pub fn open(address: &str, busy_timeout: Duration) -> Result<Arc<dyn Broker>> {
    if address == MEMORY_ADDRESS {
        Ok(Arc::new(MemoryBroker::new()))
    } else {
        Ok(Arc::new(SqliteBroker::open(address, busy_timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_key_is_stable_and_in_range() {
        assert_eq!(partition_for_key(10, 4), 2);
        assert_eq!(partition_for_key(10, 4), partition_for_key(14, 4));
        assert_eq!(partition_for_key(-1, 4), 3);
        assert_eq!(partition_for_key(7, 1), 0);
    }

    #[test]
    fn test_open_memory_address() -> Result<()> {
        let broker = open(MEMORY_ADDRESS, Duration::from_millis(10))?;
        assert_eq!(broker.name(), "memory");
        Ok(())
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("actions", 3).to_string(), "actions-3");
    }
}
