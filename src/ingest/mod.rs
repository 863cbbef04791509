//! Ingest loop: poll actions, aggregate, commit offsets
//!
//! Each worker owns a disjoint set of input partitions, its own store
//! connection and its own offset tracker. Delivery is at-least-once: offsets
//! are committed after processing, and replays are harmless because
//! non-upgrade actions are inert.
//!
//! Shutdown: the shared [`ShutdownSignal`] wakes a blocked poll, the worker
//! leaves its loop, waits for queued async commits and then commits its
//! final positions synchronously.

pub mod committer;
pub mod offsets;

pub use committer::{AsyncCommitter, CommitOutcome};
pub use offsets::OffsetTracker;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, info_span, warn};

use crate::config::{Config, ConsumerConfig, PoisonPolicy};
use crate::emitter::{EmitReport, SimilarityEmitter};
use crate::log::{Broker, LogConsumer, LogRecord, OffsetMap, Poll, TopicPartition};
use crate::model::ActionEvent;
use crate::pipeline::Aggregator;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::weights::WeightResolver;

/// Totals for one worker run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub worker: usize,
    pub processed: u64,
    pub upgrades: u64,
    pub ignored: u64,
    pub pairs_changed: u64,
    pub emit: EmitReport,
    pub dead_lettered: u64,
    pub commit_failures: u64,
    /// Positions written by the final synchronous commit
    pub committed: OffsetMap,
    /// Why the worker stopped, if not by shutdown request
    pub halted: Option<String>,
}

/// Envelope written to the dead-letter topic
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter<'a> {
    source_topic: &'a str,
    source_partition: u32,
    source_offset: u64,
    error: String,
    payload: String,
    failed_at: DateTime<Utc>,
}

pub struct IngestWorker {
    id: usize,
    settings: ConsumerConfig,
    broker: Arc<dyn Broker>,
    consumer: LogConsumer,
    tracker: OffsetTracker,
    committer: AsyncCommitter,
    aggregator: Aggregator,
    shutdown: ShutdownSignal,
    report: WorkerReport,
}

impl IngestWorker {
    pub fn new(
        id: usize,
        aggregator: Aggregator,
        broker: Arc<dyn Broker>,
        assignment: Vec<TopicPartition>,
        settings: ConsumerConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let consumer = LogConsumer::assign(
            broker.clone(),
            settings.group_id.clone(),
            assignment,
            settings.max_poll_records,
            shutdown.clone(),
        )?;
        let tracker = OffsetTracker::seeded(consumer.positions());
        let committer = AsyncCommitter::spawn(broker.clone(), settings.group_id.clone())?;

        Ok(Self {
            id,
            settings,
            broker,
            consumer,
            tracker,
            committer,
            aggregator,
            shutdown,
            report: WorkerReport {
                worker: id,
                ..Default::default()
            },
        })
    }

    /// Worker with its own store connection, built from config
    pub fn open(
        id: usize,
        config: &Config,
        broker: Arc<dyn Broker>,
        assignment: Vec<TopicPartition>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let store = Store::open(&config.store.path, config.store.busy_timeout())
            .with_context(|| format!("Worker {} failed to open store", id))?;
        let aggregator = Aggregator::new(
            store,
            WeightResolver::new(config.weights)?,
            SimilarityEmitter::new(broker.clone(), config.producer.output_topic.clone()),
        );
        Self::new(
            id,
            aggregator,
            broker,
            assignment,
            config.consumer.clone(),
            shutdown,
        )
    }

    /// Consume until shutdown or a fatal error, then commit
    pub fn run(mut self) -> WorkerReport {
        let span = info_span!("worker", id = self.id);
        let _enter = span.enter();
        info!(
            partitions = ?self.consumer.assignment(),
            group = self.consumer.group_id(),
            "Worker started"
        );

        if let Err(e) = self.consume() {
            let reason = format!("{:#}", e);
            error!(error = %reason, "Worker halted");
            self.report.halted = Some(reason);
        }

        let Self {
            consumer,
            tracker,
            committer,
            mut report,
            ..
        } = self;

        for outcome in committer.close() {
            if let Some(e) = outcome.error {
                warn!(error = %e, "Async commit failed");
                report.commit_failures += 1;
            }
        }

        match consumer.commit_sync(tracker.as_map()) {
            Ok(()) => {
                info!(offsets = ?tracker.as_map(), "Committed final offsets");
                report.committed = tracker.snapshot();
            }
            Err(e) => {
                error!(error = %e, "Final offset commit failed");
                report.commit_failures += 1;
                report.halted.get_or_insert_with(|| format!("{:#}", e));
            }
        }

        info!(
            processed = report.processed,
            upgrades = report.upgrades,
            pairs_changed = report.pairs_changed,
            "Worker stopped"
        );
        report
    }

    fn consume(&mut self) -> Result<()> {
        let poll_timeout = self.settings.poll_timeout();
        loop {
            let records = match self.consumer.poll(poll_timeout) {
                Ok(Poll::Woken) => {
                    info!("Shutdown requested, leaving poll loop");
                    return Ok(());
                }
                Ok(Poll::Records(records)) => records,
                Err(e) => {
                    warn!(error = %e, "Poll failed, retrying");
                    if self.shutdown.wait_timeout(poll_timeout) {
                        return Ok(());
                    }
                    continue;
                }
            };

            // A fetched batch is finished even if shutdown fires meanwhile
            for record in &records {
                self.handle(record)?;
            }

            if self.tracker.is_dirty() {
                self.committer.commit_async(self.tracker.snapshot());
                self.tracker.mark_committed();
            }
            self.check_commits();
        }
    }

    fn handle(&mut self, record: &LogRecord) -> Result<()> {
        let event = match ActionEvent::decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                let e = e.context(format!(
                    "Malformed record at {} offset {}",
                    record.topic_partition(),
                    record.offset
                ));
                return match self.settings.on_poison {
                    PoisonPolicy::Halt => Err(e),
                    PoisonPolicy::DeadLetter => {
                        self.dead_letter(record, &e)?;
                        self.tracker.advance(record);
                        Ok(())
                    }
                };
            }
        };

        let outcome = self.aggregator.process(&event).with_context(|| {
            format!(
                "Failed to process record at {} offset {}",
                record.topic_partition(),
                record.offset
            )
        })?;
        self.tracker.advance(record);

        self.report.processed += 1;
        if outcome.is_upgrade() {
            self.report.upgrades += 1;
        } else {
            self.report.ignored += 1;
        }
        self.report.pairs_changed += outcome.changed.len() as u64;
        self.report.emit.merge(outcome.emit);
        Ok(())
    }

    fn dead_letter(&mut self, record: &LogRecord, cause: &anyhow::Error) -> Result<()> {
        let letter = DeadLetter {
            source_topic: &record.topic,
            source_partition: record.partition,
            source_offset: record.offset,
            error: format!("{:#}", cause),
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&letter)?;
        self.broker
            .append(&self.settings.dead_letter_topic, record.key, &payload)
            .with_context(|| {
                format!(
                    "Failed to dead-letter record at {} offset {}",
                    record.topic_partition(),
                    record.offset
                )
            })?;

        warn!(
            partition = %record.topic_partition(),
            offset = record.offset,
            error = %cause,
            "Record dead-lettered"
        );
        self.report.dead_lettered += 1;
        Ok(())
    }

    fn check_commits(&mut self) {
        for outcome in self.committer.drain_completions() {
            if let Some(e) = outcome.error {
                warn!(
                    error = %e,
                    offsets = ?outcome.offsets,
                    "Async commit failed, resubmitting"
                );
                self.report.commit_failures += 1;
                self.tracker.mark_dirty();
            }
        }
    }
}

/// Spread partitions over at most `workers` workers, round-robin
///
/// Never returns an empty assignment.
pub fn assign_partitions(topic: &str, partitions: u32, workers: usize) -> Vec<Vec<TopicPartition>> {
    let count = workers.clamp(1, partitions.max(1) as usize);
    let mut assignments = vec![Vec::new(); count];
    for partition in 0..partitions {
        assignments[partition as usize % count].push(TopicPartition::new(topic, partition));
    }
    assignments
}

/// Run the configured number of workers until shutdown
///
/// A worker that halts triggers shutdown for the rest, so the consumer as a
/// whole stops.
pub fn run_workers(
    config: &Config,
    broker: Arc<dyn Broker>,
    shutdown: &ShutdownSignal,
) -> Result<Vec<WorkerReport>> {
    let consumer = &config.consumer;
    let partitions = broker.ensure_topic(&consumer.input_topic, config.broker.partitions)?;
    broker.ensure_topic(&config.producer.output_topic, config.broker.partitions)?;
    if consumer.on_poison == PoisonPolicy::DeadLetter {
        broker.ensure_topic(&consumer.dead_letter_topic, config.broker.partitions)?;
    }

    let assignments = assign_partitions(&consumer.input_topic, partitions, consumer.workers);
    if assignments.len() < consumer.workers {
        warn!(
            requested = consumer.workers,
            partitions, "More workers than partitions, extra workers not started"
        );
    }

    let workers = assignments
        .into_iter()
        .enumerate()
        .map(|(id, assignment)| {
            IngestWorker::open(id, config, broker.clone(), assignment, shutdown.clone())
        })
        .collect::<Result<Vec<_>>>()?;

    let mut handles = Vec::with_capacity(workers.len());
    for worker in workers {
        let shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("affinity-worker-{}", worker.id))
            .spawn(move || {
                let report = worker.run();
                if report.halted.is_some() {
                    shutdown.trigger();
                }
                report
            })
            .context("Failed to spawn worker thread")?;
        handles.push(handle);
    }

    handles
        .into_iter()
        .map(|handle| handle.join().map_err(|_| anyhow!("Worker thread panicked")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_partitions_round_robin() {
        let assignments = assign_partitions("actions", 5, 2);
        let partitions: Vec<Vec<u32>> = assignments
            .iter()
            .map(|a| a.iter().map(|tp| tp.partition).collect())
            .collect();
        assert_eq!(partitions, vec![vec![0, 2, 4], vec![1, 3]]);
    }

    #[test]
    fn test_assign_partitions_caps_workers() {
        let assignments = assign_partitions("actions", 2, 8);
        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.len() == 1));
    }
}
