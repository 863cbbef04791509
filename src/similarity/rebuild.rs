//! Closed-form similarity rebuild
//!
//! Recomputes every norm and pair from the interaction table in one pass.
//! Used to verify the incremental aggregates (drift report) or to replace
//! them wholesale after a bad deploy.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};

use super::cosine_from_aggregates;
use crate::model::{ItemId, ItemPair, UserId};
use crate::store::{InteractionRepo, SimilarityRepo};

/// Aggregates recomputed from scratch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedForm {
    pub sum_squares: HashMap<ItemId, f64>,
    /// Dot product per pair with at least one shared user
    pub dot_products: BTreeMap<ItemPair, f64>,
}

impl ClosedForm {
    pub fn score(&self, pair: ItemPair) -> f64 {
        let dot = self.dot_products.get(&pair).copied().unwrap_or(0.0);
        cosine_from_aggregates(
            dot,
            self.sum_squares.get(&pair.first()).copied().unwrap_or(0.0),
            self.sum_squares.get(&pair.second()).copied().unwrap_or(0.0),
        )
    }
}

/// Comparison between stored and recomputed aggregates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub items: usize,
    pub pairs: usize,
    /// Pairs whose stored dot product or score differs beyond tolerance
    pub drifted_pairs: Vec<ItemPair>,
    /// Pairs the closed form has but the store lacks
    pub missing_pairs: Vec<ItemPair>,
    /// Items whose stored norm differs beyond tolerance
    pub drifted_norms: Vec<ItemId>,
    pub max_score_drift: f64,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.drifted_pairs.is_empty()
            && self.missing_pairs.is_empty()
            && self.drifted_norms.is_empty()
    }
}

/// Compute norms and dot products from item vectors
///
/// Work is split per user: each user contributes `w_a · w_b` to every pair of
/// items they touched.
pub fn compute(item_vectors: &HashMap<ItemId, HashMap<UserId, f64>>) -> Result<ClosedForm> {
    let sum_squares: HashMap<ItemId, f64> = item_vectors
        .par_iter()
        .map(|(item, users)| (*item, users.values().map(|w| w * w).sum::<f64>()))
        .collect();

    let mut per_user: HashMap<UserId, Vec<(ItemId, f64)>> = HashMap::new();
    for (item, users) in item_vectors {
        for (user, weight) in users {
            if *weight > 0.0 {
                per_user.entry(*user).or_default().push((*item, *weight));
            }
        }
    }

    let dot_products = per_user
        .par_iter()
        .map(|(_, items)| -> Result<BTreeMap<ItemPair, f64>> {
            let mut local = BTreeMap::new();
            for (i, (a, wa)) in items.iter().enumerate() {
                for (b, wb) in &items[i + 1..] {
                    *local.entry(ItemPair::new(*a, *b)?).or_insert(0.0) += wa * wb;
                }
            }
            Ok(local)
        })
        .try_reduce(BTreeMap::new, |mut acc, other| {
            for (pair, dot) in other {
                *acc.entry(pair).or_insert(0.0) += dot;
            }
            Ok(acc)
        })?;

    Ok(ClosedForm {
        sum_squares,
        dot_products,
    })
}

/// Recompute from the interaction table and compare with stored aggregates
pub fn verify(conn: &Connection, tolerance: f64) -> Result<DriftReport> {
    let vectors = InteractionRepo::new(conn).item_vectors()?;
    let closed = compute(&vectors)?;
    let similarity = SimilarityRepo::new(conn);

    let mut report = DriftReport {
        items: closed.sum_squares.len(),
        pairs: closed.dot_products.len(),
        ..Default::default()
    };

    let stored_norms = similarity.norms()?;
    let mut drifted_norms: Vec<ItemId> = closed
        .sum_squares
        .iter()
        .filter(|(item, expected)| {
            let stored = stored_norms.get(item).copied().unwrap_or(0.0);
            (stored - **expected).abs() > tolerance
        })
        .map(|(item, _)| *item)
        .collect();
    drifted_norms.sort_unstable();
    report.drifted_norms = drifted_norms;

    let stored_pairs: HashMap<ItemPair, (f64, f64)> = similarity
        .all_pairs()?
        .into_iter()
        .map(|p| (p.pair, (p.dot_product, p.score)))
        .collect();

    for (pair, expected_dot) in &closed.dot_products {
        let expected_score = closed.score(*pair);
        match stored_pairs.get(pair) {
            None => report.missing_pairs.push(*pair),
            Some((dot, score)) => {
                let score_drift = (score - expected_score).abs();
                report.max_score_drift = report.max_score_drift.max(score_drift);
                if (dot - expected_dot).abs() > tolerance || score_drift > tolerance {
                    report.drifted_pairs.push(*pair);
                }
            }
        }
    }

    Ok(report)
}

/// Replace all stored aggregates with the closed form
///
/// Run inside a transaction so readers never see a half-written table.
pub fn rewrite(conn: &Connection, at: DateTime<Utc>) -> Result<ClosedForm> {
    let vectors = InteractionRepo::new(conn).item_vectors()?;
    let closed = compute(&vectors)?;
    let similarity = SimilarityRepo::new(conn);

    similarity.clear().context("Failed to clear similarity tables")?;
    for (item, sum_squares) in &closed.sum_squares {
        similarity.set_sum_squares(*item, *sum_squares, at)?;
    }
    for (pair, dot) in &closed.dot_products {
        similarity.upsert_pair(*pair, *dot, closed.score(*pair), at)?;
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use approx::assert_relative_eq;

    fn vectors(rows: &[(ItemId, UserId, f64)]) -> HashMap<ItemId, HashMap<UserId, f64>> {
        let mut out: HashMap<ItemId, HashMap<UserId, f64>> = HashMap::new();
        for (item, user, weight) in rows {
            out.entry(*item).or_default().insert(*user, *weight);
        }
        out
    }

    #[test]
    fn test_compute_matches_dense_cosine() -> Result<()> {
        // item1 = [3, 1], item2 = [1, 1] over users 1, 2
        let closed = compute(&vectors(&[(1, 1, 3.0), (1, 2, 1.0), (2, 1, 1.0), (2, 2, 1.0)]))?;
        let pair = ItemPair::new(1, 2)?;

        assert_eq!(closed.sum_squares[&1], 10.0);
        assert_eq!(closed.sum_squares[&2], 2.0);
        assert_eq!(closed.dot_products[&pair], 4.0);
        assert_relative_eq!(closed.score(pair), 4.0 / 20f64.sqrt(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_compute_skips_pairs_without_shared_users() -> Result<()> {
        let closed = compute(&vectors(&[(1, 1, 1.0), (2, 2, 1.0)]))?;
        assert!(closed.dot_products.is_empty());
        assert_eq!(closed.score(ItemPair::new(1, 2)?), 0.0);
        Ok(())
    }

    #[test]
    fn test_verify_detects_tampering_and_rewrite_fixes_it() -> Result<()> {
        let store = Store::open_in_memory()?;
        let now = Utc::now();
        let interactions = store.interactions();
        for (user, item, weight) in [(1, 1, 3.0), (1, 2, 1.0)] {
            interactions.insert(&crate::model::InteractionRecord {
                user_id: user,
                item_id: item,
                action_type: crate::model::ActionType::View,
                weight,
                timestamp: now,
            })?;
        }

        let report = verify(store.connection(), 1e-9)?;
        assert!(!report.is_clean());
        assert_eq!(report.missing_pairs, vec![ItemPair::new(1, 2)?]);
        assert_eq!(report.drifted_norms, vec![1, 2]);

        rewrite(store.connection(), now)?;
        let report = verify(store.connection(), 1e-9)?;
        assert!(report.is_clean(), "{:?}", report);
        assert_eq!(report.pairs, 1);
        Ok(())
    }
}
