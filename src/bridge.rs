//! Cache bridge between the durable store and the fast-tier mirror
//!
//! The durable store is written first and is the source of truth. The mirror
//! is updated afterwards on a best-effort basis and is the only thing read
//! synchronously. A crash between the two writes leaves the mirror stale
//! until the next `warmup()`.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::database::{RecordStore, META_LAST_WARMUP, META_MIRROR_MIGRATED};
use crate::error::{lock, Result};
use crate::models::{CardRecord, SessionState};
use crate::storage::{TierStorage, KEY_PREFIX};

/// Synchronous, possibly stale view of the working set. Never blocks on I/O
/// beyond the fast tier and never falls back to the durable store.
pub trait SyncView {
    fn snapshot(&self) -> SessionState;

    fn cards(&self) -> Vec<CardRecord> {
        self.snapshot().cards
    }
}

pub struct CacheBridge {
    store: RecordStore,
    tiers: Arc<TierStorage>,
    // Serializes read-modify-write of the mirror; never held across an await
    mirror_lock: Mutex<()>,
}

impl CacheBridge {
    pub fn new(store: RecordStore, tiers: Arc<TierStorage>) -> Self {
        Self {
            store,
            tiers,
            mirror_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn tiers(&self) -> &TierStorage {
        &self.tiers
    }

    /// Rebuild the mirror from the durable store; returns the record count
    pub async fn warmup(&self) -> Result<usize> {
        self.import_legacy_mirror().await;

        let records = self.store.get_all().await?;
        let count = records.len();
        let mut state = SessionState::from_records(records);

        let written = {
            let _guard = lock(&self.mirror_lock, "mirror")?;
            if let Some(previous) = self.tiers.read_session() {
                state.last_refill = previous.last_refill;
            }
            self.tiers.write_session(&state)
        };
        if written {
            log::info!("Mirror warmed with {} cards", count);
        } else {
            log::warn!("Mirror warmup write failed; durable store remains authoritative");
        }

        if let Err(e) = self.store.set_meta(META_LAST_WARMUP, &Utc::now().to_rfc3339()).await {
            log::debug!("Could not record warmup time: {}", e);
        }
        Ok(count)
    }

    /// One-off import of mirror records that never reached the durable store
    async fn import_legacy_mirror(&self) {
        match self.store.get_meta(META_MIRROR_MIGRATED).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                log::warn!("Could not read migration flag: {}", e);
                return;
            }
        }

        if let Some(mirror) = self.tiers.read_session() {
            let known: HashSet<String> = match self.store.get_all().await {
                Ok(records) => records.into_iter().map(|r| r.id).collect(),
                Err(e) => {
                    log::warn!("Skipping mirror import, durable store unreadable: {}", e);
                    return;
                }
            };
            let missing: Vec<CardRecord> = mirror
                .cards
                .iter()
                .filter(|c| !known.contains(&c.id))
                .map(|c| CardRecord {
                    shown: mirror.is_shown(c),
                    ..c.clone()
                })
                .collect();

            if !missing.is_empty() {
                match self.store.add_records(missing).await {
                    Ok(n) => log::info!("Imported {} mirror-only cards into durable store", n),
                    Err(e) => {
                        log::warn!("Mirror import failed, will retry next warmup: {}", e);
                        return;
                    }
                }
            }
        }

        if let Err(e) = self.store.set_meta(META_MIRROR_MIGRATED, "1").await {
            log::warn!("Could not record mirror import: {}", e);
        }
    }

    /// Durable write first; the mirror is only touched once that succeeds
    pub async fn add_cards(&self, records: Vec<CardRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = self.store.add_records(records.clone()).await?;

        let mirrored = self.update_mirror(|state| state.prepend(records));
        if !mirrored {
            log::warn!("Mirror not updated after adding {} cards", written);
        }
        Ok(written)
    }

    /// Mirror contents, newest first; empty when the mirror is absent
    pub fn get_cards(&self) -> Vec<CardRecord> {
        self.cards()
    }

    pub async fn mark_shown(&self, ids: &[String]) -> Result<usize> {
        let changed = self.store.mark_shown(ids.to_vec()).await?;
        let ids = ids.to_vec();
        self.update_mirror(move |state| state.mark_shown(&ids));
        Ok(changed)
    }

    pub async fn delete_cards(&self, ids: &[String]) -> Result<usize> {
        let deleted = self.store.delete_records(ids.to_vec()).await?;
        let ids = ids.to_vec();
        self.update_mirror(move |state| state.remove(&ids));
        Ok(deleted)
    }

    /// Capacity trim: drop shown records from both tiers, except `keep`.
    /// Evicted ids are retired so acquisition never brings them back.
    pub async fn evict_shown(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut ids: HashSet<String> = self.snapshot().shown_card_ids().into_iter().collect();
        ids.extend(
            self.store
                .get_all()
                .await?
                .into_iter()
                .filter(|r| r.shown)
                .map(|r| r.id),
        );
        ids.retain(|id| !keep.contains(id));
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.into_iter().collect();
        let deleted = self.store.retire_records(ids.clone()).await?;
        let count = ids.len();
        self.update_mirror(move |state| state.remove(&ids));
        log::info!("Evicted {} shown cards", count);
        Ok(deleted)
    }

    /// Ids acquisition must skip: everything cached in either tier plus
    /// every retired id
    pub async fn known_ids(&self) -> Result<HashSet<String>> {
        let mut ids = self.store.known_ids().await?;
        ids.extend(self.snapshot().cards.into_iter().map(|c| c.id));
        Ok(ids)
    }

    /// Wipe both tiers and every derived key
    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear().await?;
        self.store.clear_meta().await?;
        let removed = {
            let _guard = lock(&self.mirror_lock, "mirror")?;
            self.tiers.remove_prefixed(KEY_PREFIX)
        };
        log::info!("Cleared card cache ({} fast-tier keys removed)", removed);
        Ok(())
    }

    pub fn set_loading(&self, loading: bool) {
        self.update_mirror(move |state| state.loading = loading);
    }

    pub fn record_refill(&self) {
        self.update_mirror(|state| state.last_refill = Some(Utc::now()));
    }

    fn update_mirror<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionState),
    {
        let _guard = match lock(&self.mirror_lock, "mirror") {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Skipping mirror update: {}", e);
                return false;
            }
        };
        let mut state = self.tiers.read_session().unwrap_or_default();
        f(&mut state);
        self.tiers.write_session(&state)
    }
}

impl SyncView for CacheBridge {
    fn snapshot(&self) -> SessionState {
        self.tiers.read_session().unwrap_or_default()
    }
}
