//! In-memory broker for tests and single-process runs

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use super::{partition_for_key, Broker, LogRecord, OffsetMap, RecordPosition, TopicPartition};

/// Process-local partitioned log
#[derive(Default)]
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Vec<Vec<LogRecord>>>>,
    commits: Mutex<HashMap<(String, TopicPartition), u64>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<u32> {
        if partitions == 0 {
            bail!("Topic '{}' needs at least one partition", topic);
        }
        let mut topics = self.topics.write();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
        Ok(entry.len() as u32)
    }

    fn partition_count(&self, topic: &str) -> Result<Option<u32>> {
        Ok(self.topics.read().get(topic).map(|p| p.len() as u32))
    }

    fn append(&self, topic: &str, key: i64, payload: &[u8]) -> Result<RecordPosition> {
        let mut topics = self.topics.write();
        let Some(partitions) = topics.get_mut(topic) else {
            bail!("Topic not found: {}", topic);
        };

        let partition = partition_for_key(key, partitions.len() as u32);
        let records = &mut partitions[partition as usize];
        let offset = records.len() as u64;
        records.push(LogRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload: payload.to_vec(),
            appended_at: Utc::now(),
        });

        Ok(RecordPosition { partition, offset })
    }

    fn fetch(&self, tp: &TopicPartition, from: u64, max_records: usize) -> Result<Vec<LogRecord>> {
        let topics = self.topics.read();
        let Some(records) = topics
            .get(&tp.topic)
            .and_then(|p| p.get(tp.partition as usize))
        else {
            bail!("Partition not found: {}", tp);
        };

        Ok(records
            .iter()
            .skip(from as usize)
            .take(max_records)
            .cloned()
            .collect())
    }

    fn end_offset(&self, tp: &TopicPartition) -> Result<u64> {
        let topics = self.topics.read();
        match topics
            .get(&tp.topic)
            .and_then(|p| p.get(tp.partition as usize))
        {
            Some(records) => Ok(records.len() as u64),
            None => bail!("Partition not found: {}", tp),
        }
    }

    fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<u64>> {
        Ok(self
            .commits
            .lock()
            .get(&(group_id.to_string(), tp.clone()))
            .copied())
    }

    fn commit(&self, group_id: &str, offsets: &OffsetMap) -> Result<()> {
        let mut commits = self.commits.lock();
        for (tp, offset) in offsets {
            commits.insert((group_id.to_string(), tp.clone()), *offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_fetch_by_partition() -> Result<()> {
        let broker = MemoryBroker::new();
        assert_eq!(broker.ensure_topic("actions", 2)?, 2);
        // Re-ensuring keeps the original partition count
        assert_eq!(broker.ensure_topic("actions", 8)?, 2);

        let a = broker.append("actions", 4, b"a")?;
        let b = broker.append("actions", 6, b"b")?;
        let c = broker.append("actions", 5, b"c")?;
        assert_eq!((a.partition, a.offset), (0, 0));
        assert_eq!((b.partition, b.offset), (0, 1));
        assert_eq!((c.partition, c.offset), (1, 0));

        let tp = TopicPartition::new("actions", 0);
        let records = broker.fetch(&tp, 1, 10)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"b");
        assert_eq!(broker.end_offset(&tp)?, 2);
        Ok(())
    }

    #[test]
    fn test_append_to_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        assert!(broker.append("missing", 1, b"x").is_err());
    }

    #[test]
    fn test_commit_is_per_group() -> Result<()> {
        let broker = MemoryBroker::new();
        broker.ensure_topic("actions", 1)?;
        let tp = TopicPartition::new("actions", 0);

        let mut offsets = OffsetMap::new();
        offsets.insert(tp.clone(), 3);
        broker.commit("group-a", &offsets)?;

        assert_eq!(broker.committed("group-a", &tp)?, Some(3));
        assert_eq!(broker.committed("group-b", &tp)?, None);
        Ok(())
    }
}
