//! Group consumer over a fixed partition assignment

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Broker, LogRecord, OffsetMap, TopicPartition};
use crate::shutdown::ShutdownSignal;

/// Upper bound on one idle sleep inside [`LogConsumer::poll`]
const IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Result of one poll
#[derive(Debug)]
pub enum Poll {
    /// Records in per-partition offset order; may be empty on timeout
    Records(Vec<LogRecord>),
    /// Shutdown was requested before or during the poll
    Woken,
}

pub struct LogConsumer {
    broker: Arc<dyn Broker>,
    group_id: String,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, u64>,
    max_poll_records: usize,
    next_partition: usize,
    shutdown: ShutdownSignal,
}

impl LogConsumer {
    /// Take ownership of partitions, starting after the group's last commit
    ///
    /// Partitions the group never committed start at offset 0.
    pub fn assign(
        broker: Arc<dyn Broker>,
        group_id: impl Into<String>,
        assignment: Vec<TopicPartition>,
        max_poll_records: usize,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let group_id = group_id.into();
        let mut positions = HashMap::new();
        for tp in &assignment {
            let start = broker
                .committed(&group_id, tp)
                .with_context(|| format!("Failed to read committed offset of {}", tp))?
                .unwrap_or(0);
            debug!(partition = %tp, offset = start, "Assigned partition");
            positions.insert(tp.clone(), start);
        }

        Ok(Self {
            broker,
            group_id,
            assignment,
            positions,
            max_poll_records: max_poll_records.max(1),
            next_partition: 0,
            shutdown,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn assignment(&self) -> &[TopicPartition] {
        &self.assignment
    }

    /// Next offset that will be fetched for a partition
    pub fn position(&self, tp: &TopicPartition) -> Option<u64> {
        self.positions.get(tp).copied()
    }

    /// Current fetch positions for every assigned partition
    pub fn positions(&self) -> OffsetMap {
        self.positions
            .iter()
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect()
    }

    /// Wait up to `timeout` for records
    ///
    /// Returns [`Poll::Woken`] as soon as the shutdown signal fires, even
    /// mid-wait. Fetch errors are returned to the caller.
    pub fn poll(&mut self, timeout: Duration) -> Result<Poll> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.is_triggered() {
                return Ok(Poll::Woken);
            }

            let records = self.fetch_round()?;
            if !records.is_empty() {
                return Ok(Poll::Records(records));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Poll::Records(Vec::new()));
            }
            if self.shutdown.wait_timeout((deadline - now).min(IDLE_BACKOFF)) {
                return Ok(Poll::Woken);
            }
        }
    }

    /// Synchronously commit positions for this consumer's group
    pub fn commit_sync(&self, offsets: &OffsetMap) -> Result<()> {
        self.broker.commit(&self.group_id, offsets)
    }

    /// One pass over the assignment, starting where the last pass stopped
    ///
    /// Positions only move once every fetch of the round succeeded; a failed
    /// round leaves them untouched so the retry sees the same records.
    fn fetch_round(&mut self) -> Result<Vec<LogRecord>> {
        let mut batch = Vec::new();
        let mut advanced = Vec::new();
        let count = self.assignment.len();

        for step in 0..count {
            let remaining = self.max_poll_records - batch.len();
            if remaining == 0 {
                break;
            }
            let tp = &self.assignment[(self.next_partition + step) % count];
            let from = self.positions.get(tp).copied().unwrap_or(0);
            let records = self.broker.fetch(tp, from, remaining)?;
            if let Some(last) = records.last() {
                advanced.push((tp.clone(), last.offset + 1));
            }
            batch.extend(records);
        }

        self.positions.extend(advanced);
        if count > 0 {
            self.next_partition = (self.next_partition + 1) % count;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryBroker;
    use std::thread;

    fn broker_with(records: &[(i64, &[u8])]) -> Result<Arc<dyn Broker>> {
        let broker = MemoryBroker::new();
        broker.ensure_topic("actions", 2)?;
        for (key, payload) in records {
            broker.append("actions", *key, payload)?;
        }
        Ok(Arc::new(broker))
    }

    fn all_partitions() -> Vec<TopicPartition> {
        vec![
            TopicPartition::new("actions", 0),
            TopicPartition::new("actions", 1),
        ]
    }

    #[test]
    fn test_poll_returns_records_and_advances_positions() -> Result<()> {
        let broker = broker_with(&[(0, b"a"), (1, b"b"), (2, b"c")])?;
        let mut consumer =
            LogConsumer::assign(broker, "g", all_partitions(), 10, ShutdownSignal::new())?;

        let Poll::Records(records) = consumer.poll(Duration::from_millis(10))? else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 3);
        assert_eq!(consumer.position(&TopicPartition::new("actions", 0)), Some(2));
        assert_eq!(consumer.position(&TopicPartition::new("actions", 1)), Some(1));

        // Nothing new: times out with an empty batch
        let Poll::Records(records) = consumer.poll(Duration::from_millis(10))? else {
            panic!("expected empty batch");
        };
        assert!(records.is_empty());
        Ok(())
    }

    #[test]
    fn test_poll_caps_batch_size() -> Result<()> {
        let broker = broker_with(&[(0, b"a"), (0, b"b"), (0, b"c")])?;
        let mut consumer =
            LogConsumer::assign(broker, "g", all_partitions(), 2, ShutdownSignal::new())?;

        let Poll::Records(first) = consumer.poll(Duration::from_millis(10))? else {
            panic!("expected records");
        };
        let Poll::Records(second) = consumer.poll(Duration::from_millis(10))? else {
            panic!("expected records");
        };
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].offset, 2);
        Ok(())
    }

    #[test]
    fn test_assign_resumes_from_committed_offset() -> Result<()> {
        let broker = broker_with(&[(0, b"a"), (0, b"b"), (0, b"c")])?;
        let mut offsets = OffsetMap::new();
        offsets.insert(TopicPartition::new("actions", 0), 2);
        broker.commit("g", &offsets)?;

        let mut consumer = LogConsumer::assign(
            broker,
            "g",
            vec![TopicPartition::new("actions", 0)],
            10,
            ShutdownSignal::new(),
        )?;
        let Poll::Records(records) = consumer.poll(Duration::from_millis(10))? else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"c");
        Ok(())
    }

    #[test]
    fn test_shutdown_interrupts_blocked_poll() -> Result<()> {
        let broker = broker_with(&[])?;
        let signal = ShutdownSignal::new();
        let mut consumer = LogConsumer::assign(broker, "g", all_partitions(), 10, signal.clone())?;

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signal.trigger();
        });

        let started = Instant::now();
        let result = consumer.poll(Duration::from_secs(30))?;
        trigger.join().unwrap();

        assert!(matches!(result, Poll::Woken));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
}
