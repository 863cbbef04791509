//! Publishes changed similarity scores to the output topic
//!
//! Publishing is best effort: by the time we publish, the store transaction
//! has committed, so a failed append is logged and counted, never retried.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::log::Broker;
use crate::model::PairwiseSimilarity;

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub published: usize,
    pub failed: usize,
}

impl EmitReport {
    pub fn merge(&mut self, other: EmitReport) {
        self.published += other.published;
        self.failed += other.failed;
    }
}

pub struct SimilarityEmitter {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl SimilarityEmitter {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Publish one message per changed pair, keyed by the lower item id
    pub fn publish(&self, changed: &[PairwiseSimilarity]) -> EmitReport {
        let mut report = EmitReport::default();

        for similarity in changed {
            let message = similarity.to_message();
            let result = message
                .encode()
                .and_then(|payload| self.broker.append(&self.topic, message.item_a, &payload));

            match result {
                Ok(position) => {
                    debug!(
                        item_a = message.item_a,
                        item_b = message.item_b,
                        score = message.score,
                        partition = position.partition,
                        offset = position.offset,
                        "Published similarity"
                    );
                    report.published += 1;
                }
                Err(e) => {
                    warn!(
                        item_a = message.item_a,
                        item_b = message.item_b,
                        error = %e,
                        "Failed to publish similarity"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}
