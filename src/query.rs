//! Read side: neighbours, recommendations, interaction scores
//!
//! Opens its own connection, so reads see the last committed snapshot and
//! never wait on the ingest writer.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::model::{ItemId, UserId};
use crate::store::Store;

/// An item and how strongly it relates to the query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    pub item_id: ItemId,
    pub score: f64,
}

pub struct QueryService {
    store: Store,
}

impl QueryService {
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        Ok(Self {
            store: Store::open(path, busy_timeout)?,
        })
    }

    pub fn from_store(store: Store) -> Self {
        Self { store }
    }

    /// Most similar items, highest score first (ties by item id)
    pub fn neighbours(&self, item_id: ItemId, limit: usize) -> Result<Vec<ScoredItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .similarity()
            .neighbours(item_id, limit)?
            .into_iter()
            .map(|(item_id, score)| ScoredItem { item_id, score })
            .collect())
    }

    /// Items the user has not interacted with, ranked by
    /// `Σ score(seen, candidate) · weight(user, seen)` over the user's items
    pub fn recommend(&self, user_id: UserId, limit: usize) -> Result<Vec<ScoredItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = self.store.connection().prepare_cached(
            "SELECT candidate, SUM(score * weight) AS total FROM (
                 SELECT s.item_b AS candidate, s.score AS score, i.weight AS weight
                 FROM interactions i JOIN item_similarity s ON s.item_a = i.item_id
                 WHERE i.user_id = ?1
                 UNION ALL
                 SELECT s.item_a, s.score, i.weight
                 FROM interactions i JOIN item_similarity s ON s.item_b = i.item_id
                 WHERE i.user_id = ?1
             )
             WHERE candidate NOT IN (SELECT item_id FROM interactions WHERE user_id = ?1)
             GROUP BY candidate
             HAVING total > 0
             ORDER BY total DESC, candidate ASC
             LIMIT ?2",
        )?;

        let items = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(ScoredItem {
                    item_id: row.get(0)?,
                    score: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to rank recommendations for user {}", user_id))?;

        Ok(items)
    }

    /// Sum of interaction weights per requested item; unknown items score 0
    pub fn interaction_scores(&self, item_ids: &[ItemId]) -> Result<BTreeMap<ItemId, f64>> {
        let sums = self.store.interactions().weight_sums(item_ids)?;
        Ok(item_ids
            .iter()
            .map(|item| (*item, sums.get(item).copied().unwrap_or(0.0)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightConfig;
    use crate::model::{ActionEvent, ActionType};
    use crate::similarity;
    use crate::weights::WeightResolver;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn service(actions: &[(UserId, ItemId, ActionType)]) -> Result<QueryService> {
        let mut store = Store::open_in_memory()?;
        let resolver = WeightResolver::new(WeightConfig {
            view: 1.0,
            register: 2.0,
            like: 3.0,
        })?;
        for (user, item, action) in actions {
            let tx = store.transaction()?;
            let event = ActionEvent::new(*user, *item, *action, Utc::now());
            if let Some(delta) = resolver.apply(&tx, &event)? {
                similarity::apply_delta(&tx, &delta)?;
            }
            tx.commit()?;
        }
        Ok(QueryService::from_store(store))
    }

    #[test]
    fn test_neighbours_ordered_by_score() -> Result<()> {
        use ActionType::*;
        let service = service(&[
            (1, 1, Like),
            (1, 2, Like),
            (2, 1, Like),
            (2, 3, View),
            (3, 3, Like),
        ])?;

        let neighbours = service.neighbours(1, 10)?;
        let ids: Vec<ItemId> = neighbours.iter().map(|n| n.item_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(neighbours[0].score > neighbours[1].score);
        assert!(service.neighbours(1, 0)?.is_empty());
        assert!(service.neighbours(99, 5)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_recommend_excludes_seen_items() -> Result<()> {
        use ActionType::*;
        let service = service(&[(1, 1, Like), (1, 2, Like), (2, 1, Like), (2, 3, Register)])?;

        // User 2 has seen 1 and 3; item 2 is reachable via item 1
        let recommended = service.recommend(2, 10)?;
        assert_eq!(recommended.len(), 1);
        assert_eq!(recommended[0].item_id, 2);
        // score(1, 2) = 9 / (√18 · √9), user 2's weight on item 1 is 3
        assert_relative_eq!(
            recommended[0].score,
            3.0 * 9.0 / (18f64.sqrt() * 3.0),
            epsilon = 1e-12
        );

        assert!(service.recommend(42, 10)?.is_empty());
        assert!(service.recommend(2, 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_interaction_scores_default_to_zero() -> Result<()> {
        use ActionType::*;
        let service = service(&[(1, 1, Like), (2, 1, View), (2, 2, Register)])?;

        let scores = service.interaction_scores(&[1, 2, 7])?;
        assert_eq!(scores[&1], 4.0);
        assert_eq!(scores[&2], 2.0);
        assert_eq!(scores[&7], 0.0);
        Ok(())
    }
}
