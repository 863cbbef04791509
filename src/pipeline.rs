//! One action in, zero or more similarity updates out
//!
//! The store is updated in a single transaction (interaction record, item
//! norm and every touched pair), so a crash leaves either all of it or none
//! of it. Publishing happens after the commit.

use anyhow::{Context, Result};

use crate::emitter::{EmitReport, SimilarityEmitter};
use crate::model::{ActionEvent, PairwiseSimilarity, WeightDelta};
use crate::similarity;
use crate::store::Store;
use crate::weights::WeightResolver;

/// What processing one action did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// `None` when the action was not an upgrade
    pub delta: Option<WeightDelta>,
    /// Pairs whose score changed, in canonical order
    pub changed: Vec<PairwiseSimilarity>,
    pub emit: EmitReport,
}

impl StepOutcome {
    pub fn is_upgrade(&self) -> bool {
        self.delta.is_some()
    }
}

pub struct Aggregator {
    store: Store,
    resolver: WeightResolver,
    emitter: SimilarityEmitter,
}

impl Aggregator {
    pub fn new(store: Store, resolver: WeightResolver, emitter: SimilarityEmitter) -> Self {
        Self {
            store,
            resolver,
            emitter,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn into_store(self) -> Store {
        self.store
    }

    /// Apply one action and publish the resulting score changes
    pub fn process(&mut self, event: &ActionEvent) -> Result<StepOutcome> {
        let tx = self.store.transaction()?;

        let delta = self.resolver.apply(&tx, event)?;
        let changed = match &delta {
            Some(delta) => similarity::apply_delta(&tx, delta)?,
            None => Vec::new(),
        };

        tx.commit().with_context(|| {
            format!(
                "Failed to commit action of user {} on item {}",
                event.user_id, event.item_id
            )
        })?;

        let emit = self.emitter.publish(&changed);
        Ok(StepOutcome {
            delta,
            changed,
            emit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightConfig;
    use crate::log::{Broker, MemoryBroker, TopicPartition};
    use crate::model::ActionType;
    use chrono::Utc;
    use std::sync::Arc;

    fn aggregator(broker: Arc<dyn Broker>) -> Result<Aggregator> {
        broker.ensure_topic("similarity", 1)?;
        Ok(Aggregator::new(
            Store::open_in_memory()?,
            WeightResolver::new(WeightConfig::default())?,
            SimilarityEmitter::new(broker, "similarity"),
        ))
    }

    #[test]
    fn test_process_publishes_changed_pairs() -> Result<()> {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let mut aggregator = aggregator(broker.clone())?;

        let first = aggregator.process(&ActionEvent::new(1, 1, ActionType::Like, Utc::now()))?;
        assert!(first.is_upgrade());
        assert!(first.changed.is_empty());

        let second = aggregator.process(&ActionEvent::new(1, 2, ActionType::View, Utc::now()))?;
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.emit.published, 1);

        let records = broker.fetch(&TopicPartition::new("similarity", 0), 0, 10)?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn test_non_upgrade_writes_and_publishes_nothing() -> Result<()> {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let mut aggregator = aggregator(broker.clone())?;
        aggregator.process(&ActionEvent::new(1, 1, ActionType::Like, Utc::now()))?;
        aggregator.process(&ActionEvent::new(1, 2, ActionType::Like, Utc::now()))?;

        let outcome = aggregator.process(&ActionEvent::new(1, 2, ActionType::View, Utc::now()))?;
        assert_eq!(outcome, StepOutcome::default());
        assert_eq!(
            broker.end_offset(&TopicPartition::new("similarity", 0))?,
            1
        );
        Ok(())
    }

    #[test]
    fn test_publish_failure_keeps_store_update() -> Result<()> {
        // Output topic missing: the store still advances
        let mut aggregator = Aggregator::new(
            Store::open_in_memory()?,
            WeightResolver::new(WeightConfig::default())?,
            SimilarityEmitter::new(Arc::new(MemoryBroker::new()), "missing"),
        );
        aggregator.process(&ActionEvent::new(1, 1, ActionType::Like, Utc::now()))?;
        let outcome = aggregator.process(&ActionEvent::new(1, 2, ActionType::Like, Utc::now()))?;

        assert_eq!(outcome.emit.failed, 1);
        assert_eq!(aggregator.store().similarity().pair_count()?, 1);
        Ok(())
    }
}
