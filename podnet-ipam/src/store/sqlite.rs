//! SQLite coordination store.
//!
//! Every plugin process on a host opens the same database file; `BEGIN
//! IMMEDIATE` takes the write lock up front so the version check and the
//! write happen under one lock.

use super::{CoordinationStore, KeyValue};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use refinery::embed_migrations;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

embed_migrations!("migrations");

/// How long a writer waits for another process's transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        // Run migrations
        migrations::runner().run(&mut conn)?;
        debug!(path = %path.display(), "Opened sqlite store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let mut conn = Connection::open_in_memory()?;

        // Run migrations
        migrations::runner().run(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".to_string()))
    }

    /// Run `f` inside an immediate transaction and commit if it succeeds.
    fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn current_version(tx: &Transaction<'_>, key: &str) -> StoreResult<u64> {
    let version: Option<i64> = tx
        .query_row("SELECT version FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0) as u64)
}

fn check_version(tx: &Transaction<'_>, key: &str, expected: u64) -> StoreResult<()> {
    let actual = current_version(tx, key)?;
    if actual != expected {
        return Err(StoreError::VersionMismatch {
            key: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn next_revision(tx: &Transaction<'_>) -> StoreResult<u64> {
    let revision: i64 = tx.query_row(
        "UPDATE revision SET value = value + 1 WHERE id = 1 RETURNING value",
        [],
        |row| row.get(0),
    )?;
    Ok(revision as u64)
}

fn write(tx: &Transaction<'_>, key: &str, value: &[u8]) -> StoreResult<u64> {
    let version = next_revision(tx)?;
    tx.execute(
        "INSERT INTO kv (key, value, version) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
        params![key, value, version as i64],
    )?;
    Ok(version)
}

/// Upper bound for a prefix scan: the prefix with its last byte incremented.
fn prefix_end(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8(bytes).ok();
        }
    }
    None
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(value, version)| KeyValue {
            key: key.to_string(),
            value,
            version: version as u64,
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let conn = self.conn()?;
        let end = prefix_end(prefix);
        let mut stmt = conn.prepare(
            "SELECT key, value, version FROM kv
             WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, end], |row| {
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
                version: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            let kv = row?;
            if kv.key.starts_with(prefix) {
                out.push(kv);
            }
        }
        Ok(out)
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.write_tx(|tx| {
            if current_version(tx, key)? != 0 {
                return Err(StoreError::Conflict(key.to_string()));
            }
            write(tx, key, value)
        })
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        self.write_tx(|tx| {
            check_version(tx, key, version)?;
            write(tx, key, value)
        })
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        self.write_tx(|tx| {
            check_version(tx, key, version)?;
            next_revision(tx)?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.write_tx(|tx| write(tx, key, value))
    }
}
