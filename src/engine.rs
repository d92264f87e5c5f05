//! Pack engine: wires storage, bridge, pipeline, tracker and generator

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::bridge::{CacheBridge, SyncView};
use crate::catalog::{Catalog, RarityClassifier};
use crate::config::{EngineConfig, USAGE_WARNING_RATIO};
use crate::database::RecordStore;
use crate::error::{CacheError, Result};
use crate::images::ImageFetcher;
use crate::models::{CardRecord, PackSpec};
use crate::pack::{generate_pack, Pack};
use crate::pipeline::{AcquisitionPipeline, AcquisitionReport};
use crate::storage::{StorageEstimate, TierKind, TierStorage};
use crate::tracker::{AcquisitionGuard, RefillDecision, ShownTracker};

/// Snapshot of cache health for the CLI and the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub mirror_count: usize,
    pub unshown_count: usize,
    pub durable_count: usize,
    pub durable_unshown_count: usize,
    pub active_tier: TierKind,
    pub degraded: bool,
    pub in_flight: bool,
    pub loading: bool,
    pub last_refill: Option<DateTime<Utc>>,
    pub usage: Option<StorageEstimate>,
    pub cap: usize,
    pub pack_size: usize,
}

pub struct PackEngine {
    config: EngineConfig,
    bridge: Arc<CacheBridge>,
    tracker: ShownTracker,
}

impl PackEngine {
    /// Open the on-disk tiers under `data_dir` (`mirror/`, `mirror.db`, `cards.db`)
    pub async fn open(
        data_dir: &Path,
        catalog: Arc<dyn Catalog>,
        classifier: Arc<dyn RarityClassifier>,
        config: EngineConfig,
    ) -> Result<Self> {
        let config = config.sanitized();
        let tiers = Arc::new(TierStorage::open_default(data_dir, config.mirror_quota_bytes));
        let store = RecordStore::open(&data_dir.join("cards.db")).await?;
        let fetcher = ImageFetcher::new(config.fetch_timeout)?;
        Ok(Self::new(
            CacheBridge::new(store, tiers),
            catalog,
            classifier,
            fetcher,
            config,
        ))
    }

    pub fn new(
        bridge: CacheBridge,
        catalog: Arc<dyn Catalog>,
        classifier: Arc<dyn RarityClassifier>,
        fetcher: ImageFetcher,
        config: EngineConfig,
    ) -> Self {
        let config = config.sanitized();
        let bridge = Arc::new(bridge);
        let pipeline = Arc::new(AcquisitionPipeline::new(
            Arc::clone(&bridge),
            catalog,
            classifier,
            fetcher,
            config.clone(),
        ));
        let tracker = ShownTracker::new(
            Arc::clone(&bridge),
            pipeline,
            Arc::new(AcquisitionGuard::new()),
        );
        Self {
            config,
            bridge,
            tracker,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bridge(&self) -> &CacheBridge {
        &self.bridge
    }

    pub fn tracker(&self) -> &ShownTracker {
        &self.tracker
    }

    /// Warm the mirror, then let the refill policy decide whether to fetch.
    /// A cold cache starts its first acquisition in the background.
    pub async fn start(&self) -> Result<RefillDecision> {
        let count = self.bridge.warmup().await?;
        log::info!("Pack engine started with {} cached cards", count);
        Ok(self.tracker.trigger_if_needed())
    }

    /// Warm the mirror and, if the refill policy asks for it, refill before returning
    pub async fn warm_and_fill(&self) -> Result<Option<AcquisitionReport>> {
        self.bridge.warmup().await?;
        let decision = self.tracker.evaluate_refill();
        if !decision.should_refill() {
            log::info!("Cache is warm ({:?})", decision);
            return Ok(None);
        }
        self.refill().await
    }

    /// Deal a pack from the unshown pool and mark it shown
    pub async fn open_pack(&self, spec: &PackSpec) -> Result<Pack> {
        spec.validate_for_cap(self.config.cap)?;
        let pool = self.tracker.unshown_pool();
        let pack = generate_pack(&pool, spec, &mut rand::rng());

        if pack.cards.is_empty() {
            log::warn!("No unshown cards available for a pack");
            self.tracker.unshown_available();
            return Ok(pack);
        }
        if pack.is_short() {
            log::info!(
                "Short pack: {} of {} cards",
                pack.cards.len(),
                pack.requested
            );
        }

        self.tracker.mark_shown(&pack.ids()).await?;
        Ok(Pack {
            cards: pack
                .cards
                .into_iter()
                .map(|c| CardRecord { shown: true, ..c })
                .collect(),
            requested: pack.requested,
        })
    }

    /// Remove one card from both tiers; false when it was not cached
    pub async fn dismiss(&self, id: &str) -> Result<bool> {
        let deleted = self.bridge.delete_cards(&[id.to_string()]).await?;
        if deleted > 0 {
            log::info!("Dismissed card {}", id);
        }
        Ok(deleted > 0)
    }

    /// Awaited refill. `Ok(None)` when another acquisition is already running.
    pub async fn refill(&self) -> Result<Option<AcquisitionReport>> {
        match self.tracker.refill().await {
            Some(result) => result.map(Some),
            None => {
                log::info!("Refill requested while another is in flight");
                Ok(None)
            }
        }
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let snapshot = self.bridge.snapshot();
        let tiers = self.bridge.tiers();
        let usage = tiers.estimate_usage();
        if let Some(estimate) = usage {
            if estimate.ratio() > USAGE_WARNING_RATIO {
                log::warn!(
                    "Fast tier at {:.0}% of quota ({} of {} bytes)",
                    estimate.ratio() * 100.0,
                    estimate.used,
                    estimate.quota
                );
            }
        }

        Ok(EngineStatus {
            mirror_count: snapshot.cards.len(),
            unshown_count: snapshot.cards.len() - snapshot.shown_count(),
            durable_count: self.bridge.store().count().await?,
            durable_unshown_count: self.bridge.store().unshown_count().await?,
            active_tier: tiers.active_tier(),
            degraded: tiers.is_degraded(),
            in_flight: self.tracker.guard().is_in_flight(),
            loading: snapshot.loading,
            last_refill: snapshot.last_refill,
            usage,
            cap: self.config.cap,
            pack_size: self.config.pack_size,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        if self.tracker.guard().is_in_flight() {
            log::warn!("Clearing cache while an acquisition is in flight");
        }
        self.bridge.clear_all().await
    }

    /// Mirror contents, newest first
    pub fn cards(&self) -> Vec<CardRecord> {
        self.bridge.cards()
    }

    pub fn card(&self, id: &str) -> Result<CardRecord> {
        self.bridge
            .cards()
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| CacheError::CardNotFound(id.to_string()))
    }
}
