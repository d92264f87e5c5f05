//! Durable record store for cached cards
//!
//! SQLite-backed and authoritative. Every mutation runs in one transaction:
//! a batch either commits completely or not at all. Calls are async; the
//! connection work itself runs on tokio's blocking pool.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{lock, CacheError, Result};
use crate::models::{CardRecord, Rarity};

/// Schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 3;

/// Metadata key marking the one-off mirror import as done
pub const META_MIRROR_MIGRATED: &str = "mirror_migrated";
/// Metadata key holding the timestamp of the last successful warmup
pub const META_LAST_WARMUP: &str = "last_warmup";

const RECORD_COLUMNS: &str = "id, set_id, set_name, card_number, remote_image_ref,
     compressed_payload, filename, rarity, acquired_at, shown";

/// Async handle on the card database; cheap to clone
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    /// Open (or create) the database file and bring the schema up to date
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            log::info!("Card database: {}", path.display());
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&shared, "card database")?;
            f(&mut *conn)
        })
        .await?
    }

    /// Upsert a batch in one transaction; returns the number of records written
    pub async fn add_records(&self, batch: Vec<CardRecord>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.run(move |conn| {
            add_records_conn(conn, &batch)
                .map_err(|e| CacheError::TransactionAborted(format!("card batch rolled back: {}", e)))
        })
        .await
    }

    pub async fn get_all(&self) -> Result<Vec<CardRecord>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM cards ORDER BY acquired_at DESC, id",
                RECORD_COLUMNS
            ))?;
            let records: rusqlite::Result<Vec<CardRecord>> =
                stmt.query_map([], record_from_row)?.collect();
            Ok(records?)
        })
        .await
    }

    /// Unshown records, newest first, via the `shown` index
    pub async fn get_unshown(&self, limit: Option<usize>) -> Result<Vec<CardRecord>> {
        self.run(move |conn| {
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM cards WHERE shown = 0 ORDER BY acquired_at DESC, id LIMIT ?1",
                RECORD_COLUMNS
            ))?;
            let records: rusqlite::Result<Vec<CardRecord>> =
                stmt.query_map(params![limit], record_from_row)?.collect();
            Ok(records?)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.run(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    pub async fn unshown_count(&self) -> Result<usize> {
        self.run(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM cards WHERE shown = 0", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    /// Flag records as shown; unknown ids are ignored. Returns rows that changed.
    pub async fn mark_shown(&self, ids: Vec<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = mark_shown_tx(&tx, &ids)?;
            tx.commit()?;
            log::debug!("Marked {} of {} ids shown", changed, ids.len());
            Ok(changed)
        })
        .await
    }

    /// Delete records; ids of deleted records that were shown are retired
    pub async fn delete_records(&self, ids: Vec<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = now_text();
            let mut deleted = 0;
            {
                let mut retire = tx.prepare_cached(
                    "INSERT OR IGNORE INTO retired (id, retired_at)
                     SELECT id, ?2 FROM cards WHERE id = ?1 AND shown = 1",
                )?;
                let mut stmt = tx.prepare_cached("DELETE FROM cards WHERE id = ?1")?;
                for id in &ids {
                    retire.execute(params![id, now])?;
                    deleted += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Delete records and retire every given id, shown or not.
    /// Returns the number of records deleted.
    pub async fn retire_records(&self, ids: Vec<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = now_text();
            let mut deleted = 0;
            {
                let mut retire = tx.prepare_cached(
                    "INSERT OR IGNORE INTO retired (id, retired_at) VALUES (?1, ?2)",
                )?;
                let mut stmt = tx.prepare_cached("DELETE FROM cards WHERE id = ?1")?;
                for id in &ids {
                    retire.execute(params![id, now])?;
                    deleted += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            log::debug!("Retired {} ids ({} records deleted)", ids.len(), deleted);
            Ok(deleted)
        })
        .await
    }

    /// Ids that were shown and then removed from the working set
    pub async fn retired_ids(&self) -> Result<HashSet<String>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM retired")?;
            let ids: rusqlite::Result<HashSet<String>> =
                stmt.query_map([], |row| row.get(0))?.collect();
            Ok(ids?)
        })
        .await
    }

    /// Every id the store knows about: cached records plus retired ids
    pub async fn known_ids(&self) -> Result<HashSet<String>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM cards UNION SELECT id FROM retired")?;
            let ids: rusqlite::Result<HashSet<String>> =
                stmt.query_map([], |row| row.get(0))?.collect();
            Ok(ids?)
        })
        .await
    }

    /// Delete every card record and retired id (metadata untouched)
    pub async fn clear(&self) -> Result<usize> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute("DELETE FROM cards", [])?;
            tx.execute("DELETE FROM retired", [])?;
            tx.commit()?;
            log::info!("Cleared {} cards from database", deleted);
            Ok(deleted)
        })
        .await
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM metadata WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_meta(&self) -> Result<()> {
        self.run(|conn| {
            conn.execute("DELETE FROM metadata", [])?;
            Ok(())
        })
        .await
    }

    /// Run raw SQL against the connection (test helper for breaking the schema)
    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).unwrap();
    }
}

/// Create tables on a fresh database and upgrade older ones in place
///
/// - v1: `cards` and `metadata`
/// - v2: `cards.rarity`, indices on `shown` and `acquired_at`
/// - v3: `retired` ids of shown cards that left the working set
pub fn init_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cards (
                id                 TEXT PRIMARY KEY,
                set_id             TEXT NOT NULL,
                set_name           TEXT NOT NULL,
                card_number        TEXT NOT NULL,
                remote_image_ref   TEXT NOT NULL,
                compressed_payload BLOB NOT NULL,
                filename           TEXT NOT NULL,
                acquired_at        TEXT NOT NULL,
                shown              INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS metadata (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            PRAGMA user_version = 1;
            ",
        )?;
    }

    if version < 2 {
        conn.execute_batch(
            "
            ALTER TABLE cards ADD COLUMN rarity TEXT NOT NULL DEFAULT 'common';
            CREATE INDEX IF NOT EXISTS idx_cards_shown ON cards(shown);
            CREATE INDEX IF NOT EXISTS idx_cards_acquired ON cards(acquired_at);
            PRAGMA user_version = 2;
            ",
        )?;
    }

    if version < 3 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS retired (
                id         TEXT PRIMARY KEY,
                retired_at TEXT NOT NULL
            );
            PRAGMA user_version = 3;
            ",
        )?;
        if version >= 1 {
            log::info!("Upgraded card database schema from v{} to v{}", version, SCHEMA_VERSION);
        }
    }

    log::debug!("Card database schema at v{}", SCHEMA_VERSION);
    Ok(())
}

fn add_records_conn(conn: &mut Connection, batch: &[CardRecord]) -> Result<usize> {
    let tx = conn.transaction()?;
    let count = add_records_tx(&tx, batch)?;
    tx.commit()?;
    log::info!("Stored {} card records", count);
    Ok(count)
}

fn add_records_tx(tx: &Transaction<'_>, batch: &[CardRecord]) -> Result<usize> {
    // Provenance, payload and acquired_at belong to the first insert;
    // shown can only move from 0 to 1, and a retired id comes back shown
    let mut stmt = tx.prepare_cached(
        "INSERT INTO cards (
            id, set_id, set_name, card_number, remote_image_ref,
            compressed_payload, filename, rarity, acquired_at, shown
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
            ?10 OR EXISTS (SELECT 1 FROM retired WHERE id = ?1))
         ON CONFLICT(id) DO UPDATE SET
            filename = excluded.filename,
            rarity   = excluded.rarity,
            shown    = MAX(cards.shown, excluded.shown)",
    )?;

    let mut count = 0;
    for record in batch {
        stmt.execute(params![
            &record.id,
            &record.set_id,
            &record.set_name,
            &record.card_number,
            &record.remote_image_ref,
            &record.compressed_payload,
            &record.filename,
            record.rarity.as_str(),
            record.acquired_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            record.shown,
        ])?;
        count += 1;
    }
    Ok(count)
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn mark_shown_tx(tx: &Transaction<'_>, ids: &[String]) -> Result<usize> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let changed = tx.execute(
        &format!(
            "UPDATE cards SET shown = 1 WHERE shown = 0 AND id IN ({})",
            placeholders
        ),
        params_from_iter(ids.iter()),
    )?;
    Ok(changed)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CardRecord> {
    let rarity: String = row.get(7)?;
    let acquired_at: String = row.get(8)?;
    let acquired_at = DateTime::parse_from_rfc3339(&acquired_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(CardRecord {
        id: row.get(0)?,
        set_id: row.get(1)?,
        set_name: row.get(2)?,
        card_number: row.get(3)?,
        remote_image_ref: row.get(4)?,
        compressed_payload: row.get(5)?,
        filename: row.get(6)?,
        rarity: Rarity::from_tag(&rarity).unwrap_or(Rarity::Common),
        acquired_at,
        shown: row.get(9)?,
    })
}

#[cfg(test)]
#[path = "database_tests.rs"]
mod tests;
