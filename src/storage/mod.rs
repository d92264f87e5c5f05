//! Tier storage adapter
//!
//! Uniform, never-failing key/value façade over the first backend that passes
//! a live probe. Failures are reported through return values and the log,
//! never as errors. Quota failures run the eviction ladder and, when that is
//! exhausted, demote the adapter to an in-process map.

pub mod backends;
pub mod eviction;

pub use backends::{
    FileBackend, KvBackend, MemoryBackend, SqliteKvBackend, StorageEstimate, TierKind,
};
pub use eviction::{Eviction, EVICTION_LADDER};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::CacheError;
use crate::models::SessionState;

/// Prefix shared by every key this crate writes
pub const KEY_PREFIX: &str = "pack_cache.";
/// Key holding the serialized mirror
pub const SESSION_KEY: &str = "pack_cache.session";

pub struct TierStorage {
    active: RwLock<Arc<dyn KvBackend>>,
    degraded: AtomicBool,
}

impl TierStorage {
    /// Probe candidates in order; the first that survives a round-trip becomes active.
    /// With no survivor the adapter runs on an in-process map.
    pub fn init(candidates: Vec<Box<dyn KvBackend>>) -> Self {
        for candidate in candidates {
            match candidate.probe() {
                Ok(()) => {
                    log::info!("Storage tier active: {}", candidate.kind());
                    return Self {
                        active: RwLock::new(Arc::from(candidate)),
                        degraded: AtomicBool::new(false),
                    };
                }
                Err(e) => log::warn!("Storage tier {} failed probe: {}", candidate.kind(), e),
            }
        }

        let err = CacheError::StorageUnavailable("every persistent tier failed its probe".into());
        log::warn!("{}; running on in-process memory, nothing will survive a restart", err);
        Self {
            active: RwLock::new(Arc::new(MemoryBackend::new())),
            degraded: AtomicBool::new(true),
        }
    }

    /// File tier under `dir/mirror`, then SQLite tier at `dir/mirror.db`
    pub fn open_default(dir: &Path, quota_bytes: u64) -> Self {
        let mut candidates: Vec<Box<dyn KvBackend>> = Vec::new();
        match FileBackend::open(&dir.join("mirror"), quota_bytes) {
            Ok(backend) => candidates.push(Box::new(backend)),
            Err(e) => log::warn!("File tier unavailable: {}", e),
        }
        match SqliteKvBackend::open(&dir.join("mirror.db")) {
            Ok(backend) => candidates.push(Box::new(backend)),
            Err(e) => log::warn!("SQLite tier unavailable: {}", e),
        }
        Self::init(candidates)
    }

    /// Adapter over a single in-process map
    pub fn in_memory() -> Self {
        Self::init(vec![Box::new(MemoryBackend::new())])
    }

    fn backend(&self) -> Arc<dyn KvBackend> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn active_tier(&self) -> TierKind {
        self.backend().kind()
    }

    /// True when running on the in-process map because persistence failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        match self.backend().get(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to read {} from storage: {}", key, e);
                None
            }
        }
    }

    /// Write a value; `false` means it did not reach the active tier
    pub fn set_item(&self, key: &str, value: &str) -> bool {
        let backend = self.backend();
        match backend.set(key, value) {
            Ok(()) => true,
            Err(e) if e.is_quota_exceeded() => self.recover_from_quota(&backend, key, value),
            Err(e) => {
                log::warn!("Failed to write {} to storage: {}", key, e);
                false
            }
        }
    }

    pub fn remove_item(&self, key: &str) -> bool {
        match self.backend().remove(key) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to remove {} from storage: {}", key, e);
                false
            }
        }
    }

    /// Remove every key starting with `prefix`; returns how many went
    pub fn remove_prefixed(&self, prefix: &str) -> usize {
        let backend = self.backend();
        let keys = match backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Failed to list storage keys: {}", e);
                return 0;
            }
        };
        keys.iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| match backend.remove(k) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to remove {} from storage: {}", k, e);
                    false
                }
            })
            .count()
    }

    /// Advisory capacity report; never used to gate writes
    pub fn estimate_usage(&self) -> Option<StorageEstimate> {
        self.backend().usage()
    }

    pub fn read_session(&self) -> Option<SessionState> {
        let raw = self.get_item(SESSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("Discarding unreadable mirror state: {}", e);
                None
            }
        }
    }

    pub fn write_session(&self, state: &SessionState) -> bool {
        match serde_json::to_string(state) {
            Ok(json) => self.set_item(SESSION_KEY, &json),
            Err(e) => {
                log::warn!("Failed to serialize mirror state: {}", e);
                false
            }
        }
    }

    fn recover_from_quota(&self, backend: &Arc<dyn KvBackend>, key: &str, value: &str) -> bool {
        let writing_session = key == SESSION_KEY;
        let mut state: Option<SessionState> = if writing_session {
            serde_json::from_str(value).ok()
        } else {
            backend
                .get(SESSION_KEY)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str(&raw).ok())
        };

        for step in EVICTION_LADDER {
            let Some(current) = state.take() else {
                break;
            };
            let reduced = step.apply(current);
            log::warn!("Quota exceeded writing {}, evicting: {}", key, step);

            let attempt = match serde_json::to_string(&reduced) {
                Ok(json) if writing_session => backend.set(SESSION_KEY, &json),
                Ok(json) => {
                    // Shrink the mirror to free room, then retry the original write
                    if let Err(e) = backend.set(SESSION_KEY, &json) {
                        log::debug!("Could not shrink mirror: {}", e);
                    }
                    backend.set(key, value)
                }
                Err(e) => Err(e.into()),
            };
            state = Some(reduced);

            match attempt {
                Ok(()) => {
                    log::info!("Write of {} succeeded after eviction ({})", key, step);
                    return true;
                }
                Err(e) if e.is_quota_exceeded() => continue,
                Err(e) => {
                    log::warn!("Eviction retry for {} failed: {}", key, e);
                    break;
                }
            }
        }

        self.demote(backend, key, value);
        false
    }

    /// Replace the active tier with an in-process map seeded from it
    fn demote(&self, from: &Arc<dyn KvBackend>, key: &str, value: &str) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if !Arc::ptr_eq(&*active, from) {
            // Someone else already demoted
            if let Err(e) = active.set(key, value) {
                log::warn!("Failed to write {} after demotion: {}", key, e);
            }
            return;
        }

        let memory = MemoryBackend::new();
        let copied = copy_entries(from.as_ref(), &memory);
        if let Err(e) = memory.set(key, value) {
            log::warn!("Failed to write {} after demotion: {}", key, e);
        }

        log::warn!(
            "Eviction exhausted on {} tier, demoting to in-process memory ({} keys carried over)",
            from.kind(),
            copied
        );
        *active = Arc::new(memory);
        self.degraded.store(true, Ordering::SeqCst);
    }
}

/// Copy every readable entry of `from` into `to`; returns how many landed
fn copy_entries(from: &dyn KvBackend, to: &dyn KvBackend) -> usize {
    let keys = match from.keys() {
        Ok(keys) => keys,
        Err(e) => {
            log::warn!("Could not list {} tier keys: {}", from.kind(), e);
            return 0;
        }
    };

    let mut copied = 0;
    for k in keys {
        match from.get(&k) {
            Ok(Some(v)) => match to.set(&k, &v) {
                Ok(()) => copied += 1,
                Err(e) => log::warn!("Dropping {} while copying to {} tier: {}", k, to.kind(), e),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Could not read {} from {} tier: {}", k, from.kind(), e),
        }
    }
    copied
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
