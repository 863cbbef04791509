//! Durable interaction and similarity state
//!
//! One SQLite database holds three tables:
//! - `interactions`: (user, item) → strongest action, its weight and time
//! - `item_norms`: per-item sum of squared weights
//! - `item_similarity`: per canonical pair dot product and cosine score
//!
//! Repositories borrow a `Connection`, so the same code runs inside a
//! `Transaction` (which derefs to `Connection`) on the ingest path and on a
//! plain connection on the read path.

pub mod interactions;
pub mod similarity;

pub use interactions::InteractionRepo;
pub use similarity::SimilarityRepo;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use crate::db::SqliteDatabase;

/// Handle on the interaction/similarity database
#[derive(Debug)]
pub struct Store {
    db: SqliteDatabase,
}

impl Store {
    /// Open the store file, creating tables if necessary
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let db = SqliteDatabase::open(path, busy_timeout)?;
        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            db: SqliteDatabase::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
            -- Strongest action per (user, item); weight never decreases
            CREATE TABLE IF NOT EXISTS interactions (
                user_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                weight REAL NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (user_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_item ON interactions(item_id);

            -- Sum of squared weights per item (squared vector norm)
            CREATE TABLE IF NOT EXISTS item_norms (
                item_id INTEGER PRIMARY KEY,
                sum_squares REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- One row per unordered pair, stored as (lower id, higher id)
            CREATE TABLE IF NOT EXISTS item_similarity (
                item_a INTEGER NOT NULL,
                item_b INTEGER NOT NULL,
                dot_product REAL NOT NULL,
                score REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (item_a, item_b),
                CHECK (item_a < item_b)
            );
            CREATE INDEX IF NOT EXISTS idx_similarity_b ON item_similarity(item_b);
            "#,
            )
            .context("Failed to initialize store schema")
    }

    pub fn connection(&self) -> &Connection {
        self.db.connection()
    }

    /// Start a transaction covering one unit of work
    ///
    /// Takes the write lock up front: a deferred transaction that reads and
    /// then writes can fail without waiting when another worker committed
    /// in between.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin store transaction")
    }

    pub fn interactions(&self) -> InteractionRepo<'_> {
        InteractionRepo::new(self.connection())
    }

    pub fn similarity(&self) -> SimilarityRepo<'_> {
        SimilarityRepo::new(self.connection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_tables() -> Result<()> {
        let store = Store::open_in_memory()?;

        let tables: Vec<String> = store
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        assert!(tables.contains(&"interactions".to_string()));
        assert!(tables.contains(&"item_norms".to_string()));
        assert!(tables.contains(&"item_similarity".to_string()));
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        {
            let store = Store::open(&path, Duration::from_millis(100))?;
            store
                .similarity()
                .add_sum_squares(1, 4.0, chrono::Utc::now())?;
        }
        let store = Store::open(&path, Duration::from_millis(100))?;
        assert_eq!(store.similarity().sum_squares(1)?, 4.0);
        Ok(())
    }
}
