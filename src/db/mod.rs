//! Database access for affinity
//!
//! Thin SQLite wrapper shared by the interaction store and the local log.
//!
//! # Example
//! ```no_run
//! use affinity::db::SqliteDatabase;
//! use std::time::Duration;
//!
//! let db = SqliteDatabase::open(".affinity/data/store.db", Duration::from_secs(5))?;
//! db.execute_batch("CREATE TABLE IF NOT EXISTS test (id INTEGER)")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod sqlite;

pub use sqlite::SqliteDatabase;
