//! Batch acquisition pipeline
//!
//! Pulls candidates from the catalog, fetches and recompresses their images
//! in fixed-width waves and writes the survivors through the cache bridge in
//! a single batch.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::bridge::{CacheBridge, SyncView};
use crate::catalog::{Catalog, RarityClassifier};
use crate::config::EngineConfig;
use crate::error::{CacheError, Result};
use crate::images::ImageFetcher;
use crate::models::{CardDescriptor, CardRecord};

/// How many records to ask for: `min(requested, cap - mirror_count)` rounded
/// down to a whole number of packs
pub fn plan_batch(requested: usize, mirror_count: usize, cap: usize, pack_size: usize) -> usize {
    let available = cap.saturating_sub(mirror_count);
    let wanted = requested.min(available);
    if pack_size == 0 {
        return 0;
    }
    wanted - wanted % pack_size
}

/// Outcome of one acquisition run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionReport {
    pub requested: usize,
    pub planned: usize,
    pub attempted: usize,
    pub failed: usize,
    pub acquired: usize,
}

pub struct AcquisitionPipeline {
    bridge: Arc<CacheBridge>,
    catalog: Arc<dyn Catalog>,
    classifier: Arc<dyn RarityClassifier>,
    fetcher: ImageFetcher,
    config: EngineConfig,
}

impl AcquisitionPipeline {
    pub fn new(
        bridge: Arc<CacheBridge>,
        catalog: Arc<dyn Catalog>,
        classifier: Arc<dyn RarityClassifier>,
        fetcher: ImageFetcher,
        config: EngineConfig,
    ) -> Self {
        Self {
            bridge,
            catalog,
            classifier,
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Acquire up to `requested` records. A planned batch of zero is a
    /// successful no-op; a non-empty plan that produces nothing is
    /// `NothingAcquired`.
    pub async fn acquire(&self, requested: usize) -> Result<AcquisitionReport> {
        let mirror = self.bridge.snapshot();
        let planned = plan_batch(
            requested,
            mirror.cards.len(),
            self.config.cap,
            self.config.pack_size,
        );
        let mut report = AcquisitionReport {
            requested,
            planned,
            ..Default::default()
        };

        if planned == 0 {
            log::info!(
                "No headroom for new cards ({} of {} cached)",
                mirror.cards.len(),
                self.config.cap
            );
            return Ok(report);
        }

        // Cached and retired ids; a shown card is never acquired again
        let exclude = self.bridge.known_ids().await?;
        let candidates = self.catalog.sample(planned, &exclude);
        report.attempted = candidates.len();
        if candidates.len() < planned {
            log::warn!(
                "Catalog supplied {} of {} requested candidates",
                candidates.len(),
                planned
            );
        }

        let mut records = Vec::with_capacity(candidates.len());
        let wave_width = self.config.wave_width.max(1);
        for (wave_index, wave) in candidates.chunks(wave_width).enumerate() {
            let results = join_all(wave.iter().map(|d| self.produce(d))).await;

            let mut produced = 0;
            for (descriptor, result) in wave.iter().zip(results) {
                match result {
                    Ok(record) => {
                        records.push(record);
                        produced += 1;
                    }
                    Err(e) => {
                        log::debug!("Dropping candidate {}: {}", descriptor.id(), e);
                        report.failed += 1;
                    }
                }
            }
            log::info!(
                "Wave {}: {}/{} cards fetched",
                wave_index + 1,
                produced,
                wave.len()
            );
        }

        if records.is_empty() {
            log::warn!("Acquisition produced no cards from {} candidates", report.attempted);
            return Err(CacheError::NothingAcquired {
                attempted: report.attempted,
            });
        }

        // The mirror may have grown while the waves ran
        let headroom = self
            .config
            .cap
            .saturating_sub(self.bridge.snapshot().cards.len());
        if records.len() > headroom {
            log::info!(
                "Trimming batch of {} to {} to stay within {}",
                records.len(),
                headroom,
                self.config.cap
            );
            records.truncate(headroom);
        }
        if records.is_empty() {
            return Ok(report);
        }

        report.acquired = self.bridge.add_cards(records).await?;
        log::info!(
            "Acquired {} cards ({} failed, {} attempted)",
            report.acquired,
            report.failed,
            report.attempted
        );
        Ok(report)
    }

    async fn produce(&self, descriptor: &CardDescriptor) -> Result<CardRecord> {
        let payload = self
            .fetcher
            .fetch_compressed(&descriptor.remote_image_ref, &self.config)
            .await?;
        let rarity = self.classifier.classify(descriptor);
        Ok(CardRecord::from_descriptor(descriptor, rarity, payload))
    }
}
