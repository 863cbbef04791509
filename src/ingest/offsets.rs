//! Per-partition progress of one worker

use crate::log::{LogRecord, OffsetMap, TopicPartition};

/// Next offset to consume per partition, owned by a single worker
///
/// Only advanced after a record has been fully processed, so a commit of
/// [`OffsetTracker::snapshot`] never skips unprocessed work.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    offsets: OffsetMap,
    dirty: bool,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from already committed positions
    pub fn seeded(offsets: OffsetMap) -> Self {
        Self {
            offsets,
            dirty: false,
        }
    }

    /// Record that `record` was processed
    pub fn advance(&mut self, record: &LogRecord) {
        let next = record.offset + 1;
        let entry = self.offsets.entry(record.topic_partition()).or_insert(0);
        if next > *entry {
            *entry = next;
            self.dirty = true;
        }
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<u64> {
        self.offsets.get(tp).copied()
    }

    /// Anything processed since the last [`OffsetTracker::mark_committed`]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_committed(&mut self) {
        self.dirty = false;
    }

    /// Force the next commit check to resubmit, e.g. after a failed commit
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn snapshot(&self) -> OffsetMap {
        self.offsets.clone()
    }

    pub fn as_map(&self) -> &OffsetMap {
        &self.offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(partition: u32, offset: u64) -> LogRecord {
        LogRecord {
            topic: "actions".to_string(),
            partition,
            offset,
            key: 0,
            payload: Vec::new(),
            appended_at: Utc::now(),
        }
    }

    #[test]
    fn test_advance_stores_next_offset() {
        let mut tracker = OffsetTracker::new();
        tracker.advance(&record(0, 4));
        tracker.advance(&record(1, 0));

        assert_eq!(tracker.get(&TopicPartition::new("actions", 0)), Some(5));
        assert_eq!(tracker.get(&TopicPartition::new("actions", 1)), Some(1));
        assert!(tracker.is_dirty());
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut seed = OffsetMap::new();
        seed.insert(TopicPartition::new("actions", 0), 10);
        let mut tracker = OffsetTracker::seeded(seed);

        tracker.advance(&record(0, 3));
        assert_eq!(tracker.get(&TopicPartition::new("actions", 0)), Some(10));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_mark_committed_clears_dirty() {
        let mut tracker = OffsetTracker::new();
        tracker.advance(&record(0, 0));
        tracker.mark_committed();
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn test_mark_dirty_requests_resubmit() {
        let mut tracker = OffsetTracker::new();
        tracker.advance(&record(0, 3));
        tracker.mark_committed();
        tracker.mark_dirty();
        assert!(tracker.is_dirty());
        assert_eq!(tracker.get(&TopicPartition::new("actions", 0)), Some(4));
    }
}
