//! Weight resolution and upgrade-only dedup
//!
//! Each action type maps to a configured weight. A (user, item) pair keeps the
//! weight of the strongest action ever observed for it: weaker or equal actions
//! are inert, stronger ones upgrade the record and produce a [`WeightDelta`].

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::config::WeightConfig;
use crate::model::{ActionEvent, ActionType, InteractionRecord, WeightDelta};
use crate::store::InteractionRepo;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightResolver {
    weights: WeightConfig,
}

impl WeightResolver {
    pub fn new(weights: WeightConfig) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn resolve(&self, action: ActionType) -> f64 {
        self.weights.weight_of(action)
    }

    /// Apply one action to the interaction store
    ///
    /// Returns the weight change when the action created or upgraded the
    /// record, `None` when it was not an upgrade (and nothing was written).
    pub fn apply(&self, conn: &Connection, event: &ActionEvent) -> Result<Option<WeightDelta>> {
        let repo = InteractionRepo::new(conn);
        let new_weight = self.resolve(event.action_type);
        let candidate = InteractionRecord {
            user_id: event.user_id,
            item_id: event.item_id,
            action_type: event.action_type,
            weight: new_weight,
            timestamp: event.timestamp,
        };

        let existing = repo
            .get(event.user_id, event.item_id)
            .context("Failed to read interaction")?;

        let old_weight = match existing {
            None => {
                repo.insert(&candidate)
                    .context("Failed to insert interaction")?;
                0.0
            }
            Some(current) if new_weight > current.weight => {
                if !repo
                    .upgrade(&candidate)
                    .context("Failed to upgrade interaction")?
                {
                    return Ok(None);
                }
                current.weight
            }
            Some(_) => return Ok(None),
        };

        Ok(Some(WeightDelta {
            user_id: event.user_id,
            item_id: event.item_id,
            old_weight,
            new_weight,
            timestamp: event.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::{Duration, TimeZone, Utc};

    fn resolver() -> WeightResolver {
        WeightResolver::new(WeightConfig {
            view: 1.0,
            register: 2.0,
            like: 3.0,
        })
        .unwrap()
    }

    fn event(action: ActionType, minute: i64) -> ActionEvent {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ActionEvent::new(7, 70, action, base + Duration::minutes(minute))
    }

    #[test]
    fn test_resolve_uses_configured_magnitudes() {
        let resolver = resolver();
        assert_eq!(resolver.resolve(ActionType::View), 1.0);
        assert_eq!(resolver.resolve(ActionType::Register), 2.0);
        assert_eq!(resolver.resolve(ActionType::Like), 3.0);
    }

    #[test]
    fn test_new_rejects_invalid_weights() {
        let result = WeightResolver::new(WeightConfig {
            view: 3.0,
            register: 2.0,
            like: 1.0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_first_action_creates_record_with_zero_baseline() -> Result<()> {
        let store = Store::open_in_memory()?;
        let delta = resolver()
            .apply(store.connection(), &event(ActionType::Register, 0))?
            .expect("first action should produce a delta");

        assert_eq!(delta.old_weight, 0.0);
        assert_eq!(delta.new_weight, 2.0);
        let stored = store.interactions().get(7, 70)?.expect("record created");
        assert_eq!(stored.action_type, ActionType::Register);
        Ok(())
    }

    #[test]
    fn test_stronger_action_upgrades() -> Result<()> {
        let store = Store::open_in_memory()?;
        let resolver = resolver();
        resolver.apply(store.connection(), &event(ActionType::View, 0))?;

        let delta = resolver
            .apply(store.connection(), &event(ActionType::Like, 5))?
            .expect("upgrade should produce a delta");
        assert_eq!((delta.old_weight, delta.new_weight), (1.0, 3.0));

        let stored = store.interactions().get(7, 70)?.expect("record exists");
        assert_eq!(stored.action_type, ActionType::Like);
        assert_eq!(stored.timestamp, event(ActionType::Like, 5).timestamp);
        Ok(())
    }

    #[test]
    fn test_weaker_or_equal_action_is_inert() -> Result<()> {
        let store = Store::open_in_memory()?;
        let resolver = resolver();
        resolver.apply(store.connection(), &event(ActionType::Register, 0))?;

        assert_eq!(
            resolver.apply(store.connection(), &event(ActionType::View, 1))?,
            None
        );
        assert_eq!(
            resolver.apply(store.connection(), &event(ActionType::Register, 2))?,
            None
        );

        // Timestamp still belongs to the action that set the weight
        let stored = store.interactions().get(7, 70)?.expect("record exists");
        assert_eq!(stored.timestamp, event(ActionType::Register, 0).timestamp);
        assert_eq!(stored.weight, 2.0);
        Ok(())
    }
}
