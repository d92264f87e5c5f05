//! Key/value mechanisms behind the tier adapter
//!
//! - `FileBackend`: one file per key in a cache directory, bounded by a byte quota
//! - `SqliteKvBackend`: key/value table in a SQLite file, no quota
//! - `MemoryBackend`: in-process map, lost on exit

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{lock, CacheError, Result};

/// Key written and removed during capability probing
pub const PROBE_KEY: &str = "pack_cache.__probe__";
const PROBE_VALUE: &str = "probe";

/// Which mechanism is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    File,
    Sqlite,
    Memory,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TierKind::File => "file",
            TierKind::Sqlite => "sqlite",
            TierKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Bytes used against a known quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageEstimate {
    pub used: u64,
    pub quota: u64,
}

impl StorageEstimate {
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 1.0;
        }
        self.used as f64 / self.quota as f64
    }
}

/// Uniform key/value contract; writes over capacity fail with `QuotaExceeded`
pub trait KvBackend: Send + Sync {
    fn kind(&self) -> TierKind;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Capacity report, when the mechanism has a meaningful quota
    fn usage(&self) -> Option<StorageEstimate> {
        None
    }

    /// Live write/read/delete round-trip
    fn probe(&self) -> Result<()> {
        self.set(PROBE_KEY, PROBE_VALUE)?;
        let read_back = self.get(PROBE_KEY)?;
        self.remove(PROBE_KEY)?;
        if read_back.as_deref() == Some(PROBE_VALUE) {
            Ok(())
        } else {
            Err(CacheError::StorageUnavailable(format!(
                "{} tier did not return the probe value",
                self.kind()
            )))
        }
    }
}

// ── File ───────────────────────────────────────────────────────────────────

/// Fast tier: small JSON files in a cache directory
pub struct FileBackend {
    dir: PathBuf,
    quota_bytes: u64,
}

impl FileBackend {
    pub fn open(dir: &Path, quota_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        log::debug!("File tier directory: {:?} (quota {} bytes)", dir, quota_bytes);
        Ok(Self {
            dir: dir.to_path_buf(),
            quota_bytes,
        })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    fn used_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl KvBackend for FileBackend {
    fn kind(&self) -> TierKind {
        TierKind::File
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        // The old file may measure larger than what the directory scan saw
        let projected = self
            .used_bytes()?
            .saturating_sub(Self::file_len(&path))
            + value.len() as u64;
        if projected > self.quota_bytes {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                bytes: value.len(),
            });
        }

        // Write to a sibling and rename so readers never see a torn file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                match urlencoding::decode(stem) {
                    Ok(key) => keys.push(key.into_owned()),
                    Err(e) => log::warn!("Skipping undecodable file tier entry {:?}: {}", path, e),
                }
            }
        }
        Ok(keys)
    }

    fn usage(&self) -> Option<StorageEstimate> {
        match self.used_bytes() {
            Ok(used) => Some(StorageEstimate {
                used,
                quota: self.quota_bytes,
            }),
            Err(e) => {
                log::debug!("Could not measure file tier usage: {}", e);
                None
            }
        }
    }
}

// ── SQLite ─────────────────────────────────────────────────────────────────

/// Durable tier: key/value table in its own SQLite file
pub struct SqliteKvBackend {
    conn: Mutex<Connection>,
}

impl SqliteKvBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvBackend for SqliteKvBackend {
    fn kind(&self) -> TierKind {
        TierKind::Sqlite
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = lock(&self.conn, "sqlite tier")?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = lock(&self.conn, "sqlite tier")?;
        let result = conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::DiskFull => {
                Err(CacheError::QuotaExceeded {
                    key: key.to_string(),
                    bytes: value.len(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = lock(&self.conn, "sqlite tier")?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = lock(&self.conn, "sqlite tier")?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys: rusqlite::Result<Vec<String>> = stmt.query_map([], |row| row.get(0))?.collect();
        Ok(keys?)
    }
}

// ── Memory ─────────────────────────────────────────────────────────────────

/// Ephemeral tier: process-local map
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounded map, for exercising quota recovery
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used(entries: &HashMap<String, String>) -> u64 {
        entries.values().map(|v| v.len() as u64).sum()
    }
}

impl KvBackend for MemoryBackend {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries, "memory tier")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries, "memory tier")?;
        if let Some(quota) = self.quota_bytes {
            let existing = entries.get(key).map(|v| v.len() as u64).unwrap_or(0);
            if Self::used(&entries) - existing + value.len() as u64 > quota {
                return Err(CacheError::QuotaExceeded {
                    key: key.to_string(),
                    bytes: value.len(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries, "memory tier")?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries, "memory tier")?.keys().cloned().collect())
    }

    fn usage(&self) -> Option<StorageEstimate> {
        let quota = self.quota_bytes?;
        let entries = self.entries.lock().ok()?;
        Some(StorageEstimate {
            used: Self::used(&entries),
            quota,
        })
    }
}
