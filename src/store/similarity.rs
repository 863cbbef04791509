//! Similarity repository: per-item norms and per-pair aggregates

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::model::{ItemId, ItemPair, PairwiseSimilarity};

const PAIR_COLUMNS: &str = "s.item_a, s.item_b, s.dot_product,
        COALESCE(na.sum_squares, 0), COALESCE(nb.sum_squares, 0),
        s.score, s.updated_at";

const PAIR_JOINS: &str = "FROM item_similarity s
        LEFT JOIN item_norms na ON na.item_id = s.item_a
        LEFT JOIN item_norms nb ON nb.item_id = s.item_b";

pub struct SimilarityRepo<'c> {
    conn: &'c Connection,
}

impl<'c> SimilarityRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // =========================================================================
    // Item norms
    // =========================================================================

    /// Sum of squared weights for an item (0 if the item was never seen)
    pub fn sum_squares(&self, item_id: ItemId) -> Result<f64> {
        let value = self
            .conn
            .query_row(
                "SELECT sum_squares FROM item_norms WHERE item_id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0.0))
    }

    /// Add `change` to an item's sum of squares, returning the new value
    pub fn add_sum_squares(
        &self,
        item_id: ItemId,
        change: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<f64> {
        self.conn.execute(
            r#"
            INSERT INTO item_norms (item_id, sum_squares, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(item_id) DO UPDATE SET
                sum_squares = sum_squares + excluded.sum_squares,
                updated_at = excluded.updated_at
            "#,
            params![item_id, change, updated_at],
        )?;
        self.sum_squares(item_id)
    }

    /// All item norms
    pub fn norms(&self) -> Result<HashMap<ItemId, f64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id, sum_squares FROM item_norms")?;
        let norms = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(norms)
    }

    // =========================================================================
    // Pairs
    // =========================================================================

    /// Stored dot product for a pair, if the pair exists
    pub fn dot_product(&self, pair: ItemPair) -> Result<Option<f64>> {
        let value = self
            .conn
            .query_row(
                "SELECT dot_product FROM item_similarity WHERE item_a = ?1 AND item_b = ?2",
                params![pair.first(), pair.second()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Create or overwrite the aggregates of a pair
    pub fn upsert_pair(
        &self,
        pair: ItemPair,
        dot_product: f64,
        score: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO item_similarity (item_a, item_b, dot_product, score, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(item_a, item_b) DO UPDATE SET
                dot_product = excluded.dot_product,
                score = excluded.score,
                updated_at = excluded.updated_at
            "#,
            params![pair.first(), pair.second(), dot_product, score, updated_at],
        )?;
        Ok(())
    }

    /// Full view of one pair, norms included
    pub fn pair(&self, pair: ItemPair) -> Result<Option<PairwiseSimilarity>> {
        let sql = format!(
            "SELECT {} {} WHERE s.item_a = ?1 AND s.item_b = ?2",
            PAIR_COLUMNS, PAIR_JOINS
        );
        let result = self
            .conn
            .query_row(&sql, params![pair.first(), pair.second()], pair_from_row)
            .optional()?;
        Ok(result)
    }

    /// Every persisted pair that has `item_id` on either side
    pub fn pairs_touching(&self, item_id: ItemId) -> Result<Vec<PairwiseSimilarity>> {
        let sql = format!(
            "SELECT {} {} WHERE s.item_a = ?1 OR s.item_b = ?1 ORDER BY s.item_a, s.item_b",
            PAIR_COLUMNS, PAIR_JOINS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let pairs = stmt
            .query_map(params![item_id], pair_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    /// Neighbours of an item, best score first
    pub fn neighbours(&self, item_id: ItemId, limit: usize) -> Result<Vec<(ItemId, f64)>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT CASE WHEN item_a = ?1 THEN item_b ELSE item_a END AS neighbour, score
            FROM item_similarity
            WHERE item_a = ?1 OR item_b = ?1
            ORDER BY score DESC, neighbour ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![item_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All persisted pairs
    pub fn all_pairs(&self) -> Result<Vec<PairwiseSimilarity>> {
        let sql = format!(
            "SELECT {} {} ORDER BY s.item_a, s.item_b",
            PAIR_COLUMNS, PAIR_JOINS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let pairs = stmt
            .query_map([], pair_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    pub fn pair_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM item_similarity", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop all norms and pairs (used before a full rebuild)
    pub fn clear(&self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM item_similarity; DELETE FROM item_norms;")?;
        Ok(())
    }

    /// Overwrite an item's norm
    pub fn set_sum_squares(
        &self,
        item_id: ItemId,
        sum_squares: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO item_norms (item_id, sum_squares, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(item_id) DO UPDATE SET
                sum_squares = excluded.sum_squares,
                updated_at = excluded.updated_at
            "#,
            params![item_id, sum_squares, updated_at],
        )?;
        Ok(())
    }
}

fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<PairwiseSimilarity> {
    let first: ItemId = row.get(0)?;
    let second: ItemId = row.get(1)?;
    let pair = ItemPair::new(first, second).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            e.to_string().into(),
        )
    })?;

    Ok(PairwiseSimilarity {
        pair,
        dot_product: row.get(2)?,
        sum_squares_first: row.get(3)?,
        sum_squares_second: row.get(4)?,
        score: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_sum_squares_accumulates() -> Result<()> {
        let store = Store::open_in_memory()?;
        let repo = store.similarity();

        assert_eq!(repo.sum_squares(1)?, 0.0);
        assert_eq!(repo.add_sum_squares(1, 9.0, Utc::now())?, 9.0);
        assert_eq!(repo.add_sum_squares(1, 1.0, Utc::now())?, 10.0);
        assert_eq!(repo.norms()?.get(&1), Some(&10.0));
        Ok(())
    }

    #[test]
    fn test_upsert_pair_and_read_back() -> Result<()> {
        let store = Store::open_in_memory()?;
        let repo = store.similarity();
        let pair = ItemPair::new(5, 2)?;

        repo.add_sum_squares(2, 4.0, Utc::now())?;
        repo.add_sum_squares(5, 1.0, Utc::now())?;
        repo.upsert_pair(pair, 2.0, 1.0, Utc::now())?;
        repo.upsert_pair(pair, 1.5, 0.75, Utc::now())?;

        let stored = repo.pair(pair)?.expect("pair should exist");
        assert_eq!(stored.pair.first(), 2);
        assert_eq!(stored.dot_product, 1.5);
        assert_eq!(stored.sum_squares_first, 4.0);
        assert_eq!(stored.sum_squares_second, 1.0);
        assert_eq!(stored.score, 0.75);
        assert_eq!(repo.pair_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_neighbours_ordered_from_either_side() -> Result<()> {
        let store = Store::open_in_memory()?;
        let repo = store.similarity();

        repo.upsert_pair(ItemPair::new(1, 2)?, 1.0, 0.3, Utc::now())?;
        repo.upsert_pair(ItemPair::new(0, 2)?, 1.0, 0.9, Utc::now())?;
        repo.upsert_pair(ItemPair::new(2, 3)?, 1.0, 0.3, Utc::now())?;
        repo.upsert_pair(ItemPair::new(1, 3)?, 1.0, 0.5, Utc::now())?;

        assert_eq!(repo.neighbours(2, 10)?, vec![(0, 0.9), (1, 0.3), (3, 0.3)]);
        assert_eq!(repo.neighbours(2, 1)?, vec![(0, 0.9)]);
        assert!(repo.neighbours(42, 10)?.is_empty());
        assert_eq!(repo.pairs_touching(3)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_clear_removes_aggregates() -> Result<()> {
        let store = Store::open_in_memory()?;
        let repo = store.similarity();

        repo.set_sum_squares(1, 2.0, Utc::now())?;
        repo.upsert_pair(ItemPair::new(1, 2)?, 1.0, 0.5, Utc::now())?;
        repo.clear()?;

        assert_eq!(repo.pair_count()?, 0);
        assert!(repo.norms()?.is_empty());
        Ok(())
    }
}
