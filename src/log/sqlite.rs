//! Durable log backed by a SQLite file
//!
//! Producers and consumers in different processes share the file. WAL mode
//! lets a consumer read while a producer appends; appends take the write lock
//! up front so two producers never race for the same offset.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::{partition_for_key, Broker, LogRecord, OffsetMap, RecordPosition, TopicPartition};
use crate::db::SqliteDatabase;

pub struct SqliteBroker {
    conn: Mutex<Connection>,
}

impl SqliteBroker {
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let db = SqliteDatabase::open(path, busy_timeout)?;
        let broker = Self {
            conn: Mutex::new(db.into_connection()),
        };
        broker.init_schema()?;
        Ok(broker)
    }

    pub fn open_in_memory() -> Result<Self> {
        let broker = Self {
            conn: Mutex::new(SqliteDatabase::open_in_memory()?.into_connection()),
        };
        broker.init_schema()?;
        Ok(broker)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS topics (
                name TEXT PRIMARY KEY,
                partitions INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Append-only; (topic, partition_id, log_offset) is dense from 0
            CREATE TABLE IF NOT EXISTS log_records (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                log_offset INTEGER NOT NULL,
                record_key INTEGER NOT NULL,
                payload BLOB NOT NULL,
                appended_at TEXT NOT NULL,
                PRIMARY KEY (topic, partition_id, log_offset)
            );

            CREATE TABLE IF NOT EXISTS consumer_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            );
            "#,
            )
            .context("Failed to initialize log schema")
    }
}

fn partitions_of(conn: &Connection, topic: &str) -> Result<Option<u32>> {
    conn.query_row(
        "SELECT partitions FROM topics WHERE name = ?1",
        [topic],
        |row| row.get::<_, u32>(0),
    )
    .optional()
    .with_context(|| format!("Failed to look up topic {}", topic))
}

fn next_offset(conn: &Connection, tp: &TopicPartition) -> Result<u64> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM log_records
         WHERE topic = ?1 AND partition_id = ?2",
        params![tp.topic, tp.partition],
        |row| row.get(0),
    )?;
    Ok(next as u64)
}

impl Broker for SqliteBroker {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<u32> {
        if partitions == 0 {
            bail!("Topic '{}' needs at least one partition", topic);
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO topics (name, partitions, created_at) VALUES (?1, ?2, ?3)",
            params![topic, partitions, Utc::now()],
        )
        .with_context(|| format!("Failed to create topic {}", topic))?;

        match partitions_of(&conn, topic)? {
            Some(count) => Ok(count),
            None => bail!("Topic {} vanished after creation", topic),
        }
    }

    fn partition_count(&self, topic: &str) -> Result<Option<u32>> {
        partitions_of(&self.conn.lock(), topic)
    }

    fn append(&self, topic: &str, key: i64, payload: &[u8]) -> Result<RecordPosition> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to lock log for append")?;

        let Some(partitions) = partitions_of(&tx, topic)? else {
            bail!("Topic not found: {}", topic);
        };
        let tp = TopicPartition::new(topic, partition_for_key(key, partitions));
        let offset = next_offset(&tx, &tp)?;

        tx.execute(
            "INSERT INTO log_records (topic, partition_id, log_offset, record_key, payload, appended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![tp.topic, tp.partition, offset as i64, key, payload, Utc::now()],
        )
        .with_context(|| format!("Failed to append to {}", tp))?;
        tx.commit().context("Failed to commit append")?;

        Ok(RecordPosition {
            partition: tp.partition,
            offset,
        })
    }

    fn fetch(&self, tp: &TopicPartition, from: u64, max_records: usize) -> Result<Vec<LogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT log_offset, record_key, payload, appended_at FROM log_records
             WHERE topic = ?1 AND partition_id = ?2 AND log_offset >= ?3
             ORDER BY log_offset
             LIMIT ?4",
        )?;

        let records = stmt
            .query_map(
                params![tp.topic, tp.partition, from as i64, max_records as i64],
                |row| {
                    let offset: i64 = row.get(0)?;
                    let appended_at: DateTime<Utc> = row.get(3)?;
                    Ok(LogRecord {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: offset as u64,
                        key: row.get(1)?,
                        payload: row.get(2)?,
                        appended_at,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to fetch from {}", tp))?;

        Ok(records)
    }

    fn end_offset(&self, tp: &TopicPartition) -> Result<u64> {
        next_offset(&self.conn.lock(), tp)
    }

    fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let result: Result<i64, _> = conn.query_row(
            "SELECT next_offset FROM consumer_offsets
             WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
            params![group_id, tp.topic, tp.partition],
            |row| row.get(0),
        );

        match result {
            Ok(offset) => Ok(Some(offset as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, group_id: &str, offsets: &OffsetMap) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        for (tp, offset) in offsets {
            tx.execute(
                "INSERT OR REPLACE INTO consumer_offsets (group_id, topic, partition_id, next_offset, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![group_id, tp.topic, tp.partition, *offset as i64, now],
            )?;
        }
        tx.commit()
            .with_context(|| format!("Failed to commit offsets for group {}", group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_dense_offsets_per_partition() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        broker.ensure_topic("actions", 2)?;

        let positions: Vec<RecordPosition> = [2, 3, 4, 5]
            .iter()
            .map(|key| broker.append("actions", *key, b"{}"))
            .collect::<Result<_>>()?;

        assert_eq!(
            positions,
            vec![
                RecordPosition { partition: 0, offset: 0 },
                RecordPosition { partition: 1, offset: 0 },
                RecordPosition { partition: 0, offset: 1 },
                RecordPosition { partition: 1, offset: 1 },
            ]
        );
        assert_eq!(broker.end_offset(&TopicPartition::new("actions", 0))?, 2);
        Ok(())
    }

    #[test]
    fn test_fetch_respects_start_and_limit() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        broker.ensure_topic("actions", 1)?;
        for i in 0..5u8 {
            broker.append("actions", 1, &[i])?;
        }

        let tp = TopicPartition::new("actions", 0);
        let records = broker.fetch(&tp, 2, 2)?;
        let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(records[0].payload, vec![2]);
        assert!(broker.fetch(&tp, 5, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_commits_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.db");
        let tp = TopicPartition::new("actions", 0);
        {
            let broker = SqliteBroker::open(&path, Duration::from_millis(100))?;
            broker.ensure_topic("actions", 1)?;
            let mut offsets = OffsetMap::new();
            offsets.insert(tp.clone(), 7);
            broker.commit("aggregator", &offsets)?;
        }

        let broker = SqliteBroker::open(&path, Duration::from_millis(100))?;
        assert_eq!(broker.committed("aggregator", &tp)?, Some(7));
        assert_eq!(broker.committed("other", &tp)?, None);
        assert_eq!(broker.partition_count("actions")?, Some(1));
        Ok(())
    }

    #[test]
    fn test_append_to_unknown_topic_fails() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        let err = broker.append("missing", 1, b"x").unwrap_err();
        assert!(err.to_string().contains("Topic not found"));
        Ok(())
    }
}
