//! Interaction repository: (user, item) → strongest action

use anyhow::Result;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::model::{ActionType, InteractionRecord, ItemId, UserId};

pub struct InteractionRepo<'c> {
    conn: &'c Connection,
}

impl<'c> InteractionRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Get the record for a (user, item) pair
    pub fn get(&self, user_id: UserId, item_id: ItemId) -> Result<Option<InteractionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT user_id, item_id, action_type, weight, timestamp
                 FROM interactions WHERE user_id = ?1 AND item_id = ?2",
                params![user_id, item_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a record for a pair seen for the first time
    pub fn insert(&self, record: &InteractionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO interactions (user_id, item_id, action_type, weight, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.user_id,
                record.item_id,
                record.action_type.as_str(),
                record.weight,
                record.timestamp
            ],
        )?;
        Ok(())
    }

    /// Move an existing record to a stronger action
    ///
    /// Returns false when the stored weight is already >= the new one, so the
    /// row can never move down even if two writers race.
    pub fn upgrade(&self, record: &InteractionRecord) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE interactions
             SET action_type = ?3, weight = ?4, timestamp = ?5
             WHERE user_id = ?1 AND item_id = ?2 AND weight < ?4",
            params![
                record.user_id,
                record.item_id,
                record.action_type.as_str(),
                record.weight,
                record.timestamp
            ],
        )?;
        Ok(updated == 1)
    }

    /// Items the user has a positive weight on, with that weight
    pub fn items_for_user(&self, user_id: UserId) -> Result<Vec<(ItemId, f64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT item_id, weight FROM interactions
             WHERE user_id = ?1 AND weight > 0
             ORDER BY item_id",
        )?;
        let items = stmt
            .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Sum of interaction weights per item, for the requested items only
    pub fn weight_sums(&self, item_ids: &[ItemId]) -> Result<HashMap<ItemId, f64>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let sql = format!(
            "SELECT item_id, SUM(weight) FROM interactions
             WHERE item_id IN ({})
             GROUP BY item_id",
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sums = stmt
            .query_map(params_from_iter(item_ids.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(sums)
    }

    /// All records, grouped by item (the item vectors)
    pub fn item_vectors(&self) -> Result<HashMap<ItemId, HashMap<UserId, f64>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id, user_id, weight FROM interactions")?;
        let mut rows = stmt.query([])?;

        let mut vectors: HashMap<ItemId, HashMap<UserId, f64>> = HashMap::new();
        while let Some(row) = rows.next()? {
            let item_id: ItemId = row.get(0)?;
            let user_id: UserId = row.get(1)?;
            let weight: f64 = row.get(2)?;
            vectors.entry(item_id).or_default().insert(user_id, weight);
        }
        Ok(vectors)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<InteractionRecord> {
    let action: String = row.get(2)?;
    let action_type = ActionType::from_str(&action).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown action type '{}'", action).into(),
        )
    })?;

    Ok(InteractionRecord {
        user_id: row.get(0)?,
        item_id: row.get(1)?,
        action_type,
        weight: row.get(3)?,
        timestamp: row.get(4)?,
    })
}
