//! Background offset commits
//!
//! The worker hands offset snapshots to a dedicated thread and keeps
//! processing. Outcomes come back on a completion channel the worker drains
//! between batches. A failed async commit is only logged: a later commit (at
//! the latest the final synchronous one) covers the same offsets.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

use crate::log::{Broker, OffsetMap};

/// Result of one commit request
#[derive(Debug)]
pub struct CommitOutcome {
    pub offsets: OffsetMap,
    pub error: Option<anyhow::Error>,
}

impl CommitOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct AsyncCommitter {
    requests: Option<Sender<OffsetMap>>,
    completions: Receiver<CommitOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncCommitter {
    pub fn spawn(broker: Arc<dyn Broker>, group_id: impl Into<String>) -> Result<Self> {
        let group_id = group_id.into();
        let (request_tx, request_rx) = mpsc::channel::<OffsetMap>();
        let (done_tx, done_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("affinity-committer".to_string())
            .spawn(move || {
                for offsets in request_rx {
                    let error = broker.commit(&group_id, &offsets).err();
                    if done_tx.send(CommitOutcome { offsets, error }).is_err() {
                        break;
                    }
                }
            })
            .context("Failed to spawn committer thread")?;

        Ok(Self {
            requests: Some(request_tx),
            completions: done_rx,
            handle: Some(handle),
        })
    }

    /// Queue a commit; returns immediately
    pub fn commit_async(&self, offsets: OffsetMap) {
        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(offsets).is_err() {
            warn!("Committer thread is gone, async commit dropped");
        }
    }

    /// Outcomes of commits finished since the last call
    pub fn drain_completions(&self) -> Vec<CommitOutcome> {
        self.completions.try_iter().collect()
    }

    /// Stop accepting requests, wait for queued ones, return their outcomes
    pub fn close(mut self) -> Vec<CommitOutcome> {
        self.shutdown();
        self.completions.try_iter().collect()
    }

    fn shutdown(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Committer thread panicked");
            }
        }
    }
}

impl Drop for AsyncCommitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MemoryBroker, TopicPartition};

    fn offsets(next: u64) -> OffsetMap {
        let mut map = OffsetMap::new();
        map.insert(TopicPartition::new("actions", 0), next);
        map
    }

    #[test]
    fn test_close_flushes_pending_commits() -> Result<()> {
        let broker = Arc::new(MemoryBroker::new());
        let committer = AsyncCommitter::spawn(broker.clone(), "g")?;

        committer.commit_async(offsets(3));
        committer.commit_async(offsets(5));
        let outcomes = committer.close();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(CommitOutcome::is_ok));
        assert_eq!(
            broker.committed("g", &TopicPartition::new("actions", 0))?,
            Some(5)
        );
        Ok(())
    }

    #[test]
    fn test_drain_returns_each_outcome_once() -> Result<()> {
        let committer = AsyncCommitter::spawn(Arc::new(MemoryBroker::new()), "g")?;
        committer.commit_async(offsets(1));

        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(committer.drain_completions());
            if !seen.is_empty() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(seen.len(), 1);
        assert!(committer.drain_completions().is_empty());
        Ok(())
    }
}
