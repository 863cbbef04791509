//! Incremental item-to-item cosine similarity
//!
//! For every weight delta `(user, item, wOld → wNew)`:
//!
//! ```text
//! sumSq[item]      += wNew² - wOld²
//! dot(item, other) += (wNew - wOld) * w(user, other)   for each other item of the user
//! score            =  dot / (√sumSq[a] · √sumSq[b])     (0 when a norm is 0)
//! ```
//!
//! Applying a delta twice double-counts, so callers must only feed deltas that
//! came out of [`crate::weights::WeightResolver::apply`].

pub mod rebuild;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;

use crate::model::{ItemPair, PairwiseSimilarity, WeightDelta};
use crate::store::{InteractionRepo, SimilarityRepo};

/// Cosine score from a dot product and the two sums of squares
pub fn cosine_from_aggregates(dot_product: f64, sum_squares_a: f64, sum_squares_b: f64) -> f64 {
    if sum_squares_a <= 0.0 || sum_squares_b <= 0.0 {
        return 0.0;
    }
    (dot_product / (sum_squares_a.sqrt() * sum_squares_b.sqrt())).clamp(-1.0, 1.0)
}

/// Apply one weight delta, returning every pair whose score changed
///
/// Must run after the interaction store holds `wNew` and inside the same
/// transaction. Pairs are returned in canonical order.
pub fn apply_delta(conn: &Connection, delta: &WeightDelta) -> Result<Vec<PairwiseSimilarity>> {
    let interactions = InteractionRepo::new(conn);
    let similarity = SimilarityRepo::new(conn);
    let at = delta.timestamp;

    let item_sum_squares = similarity
        .add_sum_squares(delta.item_id, delta.square_change(), at)
        .with_context(|| format!("Failed to update norm of item {}", delta.item_id))?;

    let mut changed: BTreeMap<ItemPair, PairwiseSimilarity> = BTreeMap::new();

    // Pairs whose dot product moves: the user's other items
    for (other_item, other_weight) in interactions.items_for_user(delta.user_id)? {
        if other_item == delta.item_id {
            continue;
        }
        let pair = ItemPair::new(delta.item_id, other_item)?;
        let dot_product = similarity.dot_product(pair)?.unwrap_or(0.0)
            + delta.weight_change() * other_weight;
        let other_sum_squares = similarity.sum_squares(other_item)?;

        let (sum_squares_first, sum_squares_second) = if pair.first() == delta.item_id {
            (item_sum_squares, other_sum_squares)
        } else {
            (other_sum_squares, item_sum_squares)
        };
        let score = cosine_from_aggregates(dot_product, sum_squares_first, sum_squares_second);

        similarity
            .upsert_pair(pair, dot_product, score, at)
            .with_context(|| format!("Failed to store pair {:?}", pair))?;
        changed.insert(
            pair,
            PairwiseSimilarity {
                pair,
                dot_product,
                sum_squares_first,
                sum_squares_second,
                score,
                updated_at: at,
            },
        );
    }

    // The item's norm moved, so every other pair it belongs to needs a new score
    if delta.square_change() != 0.0 {
        for existing in similarity.pairs_touching(delta.item_id)? {
            if changed.contains_key(&existing.pair) {
                continue;
            }
            let score = cosine_from_aggregates(
                existing.dot_product,
                existing.sum_squares_first,
                existing.sum_squares_second,
            );
            if score.to_bits() == existing.score.to_bits() {
                continue;
            }
            similarity.upsert_pair(existing.pair, existing.dot_product, score, at)?;
            changed.insert(
                existing.pair,
                PairwiseSimilarity {
                    score,
                    updated_at: at,
                    ..existing
                },
            );
        }
    }

    Ok(changed.into_values().collect())
}
