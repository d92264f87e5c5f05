//! Shown-state tracking and the background refill trigger

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::bridge::{CacheBridge, SyncView};
use crate::error::{lock, Result};
use crate::models::CardRecord;
use crate::pipeline::{AcquisitionPipeline, AcquisitionReport};

/// Single-flight flag for acquisition runs
#[derive(Debug, Default)]
pub struct AcquisitionGuard {
    in_flight: AtomicBool,
}

impl AcquisitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard if it is free. The returned ticket releases it on drop.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AcquisitionTicket> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AcquisitionTicket {
                guard: Arc::clone(self),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Proof of holding the acquisition guard
#[derive(Debug)]
pub struct AcquisitionTicket {
    guard: Arc<AcquisitionGuard>,
}

impl Drop for AcquisitionTicket {
    fn drop(&mut self) {
        self.guard.in_flight.store(false, Ordering::Release);
    }
}

/// Result of evaluating the refill policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillDecision {
    /// Enough unshown cards left
    NotNeeded { unshown: usize },
    /// Unshown count at or below the threshold
    BelowThreshold { unshown: usize },
    /// Mirror is non-empty but every card has been shown
    Exhausted,
}

impl RefillDecision {
    pub fn should_refill(&self) -> bool {
        !matches!(self, RefillDecision::NotNeeded { .. })
    }
}

#[derive(Clone)]
pub struct ShownTracker {
    bridge: Arc<CacheBridge>,
    pipeline: Arc<AcquisitionPipeline>,
    guard: Arc<AcquisitionGuard>,
    refill_threshold: usize,
    // Ids of the most recently dealt pack; the capacity trim leaves them alone
    last_dealt: Arc<Mutex<HashSet<String>>>,
}

impl ShownTracker {
    pub fn new(
        bridge: Arc<CacheBridge>,
        pipeline: Arc<AcquisitionPipeline>,
        guard: Arc<AcquisitionGuard>,
    ) -> Self {
        let refill_threshold = pipeline.config().refill_threshold;
        Self {
            bridge,
            pipeline,
            guard,
            refill_threshold,
            last_dealt: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn guard(&self) -> &Arc<AcquisitionGuard> {
        &self.guard
    }

    /// Forward to the bridge, remember `ids` as the latest dealt pack, then
    /// check whether a refill is due
    pub async fn mark_shown(&self, ids: &[String]) -> Result<usize> {
        let changed = self.bridge.mark_shown(ids).await?;
        *lock(&self.last_dealt, "last dealt pack")? = ids.iter().cloned().collect();
        self.trigger_if_needed();
        Ok(changed)
    }

    /// Unshown records in mirror order
    pub fn unshown_pool(&self) -> Vec<CardRecord> {
        self.bridge.snapshot().unshown()
    }

    /// `mirror count - shown count`; an exhausted non-empty mirror starts a refill
    pub fn unshown_available(&self) -> usize {
        let snapshot = self.bridge.snapshot();
        let available = snapshot.cards.len() - snapshot.shown_count();
        if available == 0 && !snapshot.cards.is_empty() {
            self.trigger_if_needed();
        }
        available
    }

    pub fn evaluate_refill(&self) -> RefillDecision {
        let snapshot = self.bridge.snapshot();
        let unshown = snapshot.cards.len() - snapshot.shown_count();
        if unshown == 0 && !snapshot.cards.is_empty() {
            RefillDecision::Exhausted
        } else if unshown <= self.refill_threshold {
            RefillDecision::BelowThreshold { unshown }
        } else {
            RefillDecision::NotNeeded { unshown }
        }
    }

    /// Start a background refill when the policy asks for one and nothing is
    /// in flight. A held guard drops the request; the running job
    /// re-evaluates when it finishes.
    pub fn trigger_if_needed(&self) -> RefillDecision {
        let decision = self.evaluate_refill();
        if !decision.should_refill() {
            return decision;
        }

        let ticket = match self.guard.try_acquire() {
            Some(ticket) => ticket,
            None => {
                log::debug!("Refill already in flight, skipping ({:?})", decision);
                return decision;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::info!("Starting background refill ({:?})", decision);
                let tracker = self.clone();
                handle.spawn(async move {
                    if let Err(e) = tracker.run_refill(ticket).await {
                        log::warn!("Background refill failed: {}", e);
                    }
                });
            }
            Err(_) => {
                log::warn!("No async runtime available, refill deferred");
            }
        }
        decision
    }

    /// Run a refill now. `None` when another acquisition holds the guard.
    pub async fn refill(&self) -> Option<Result<AcquisitionReport>> {
        let ticket = self.guard.try_acquire()?;
        Some(self.run_refill(ticket).await)
    }

    async fn run_refill(&self, ticket: AcquisitionTicket) -> Result<AcquisitionReport> {
        self.bridge.set_loading(true);
        let result = self.trim_and_acquire().await;
        self.bridge.set_loading(false);
        drop(ticket);

        if let Ok(report) = &result {
            self.bridge.record_refill();
            // Only loop back when this run made progress
            if report.acquired > 0 {
                self.trigger_if_needed();
            }
        }
        result
    }

    async fn trim_and_acquire(&self) -> Result<AcquisitionReport> {
        let keep = lock(&self.last_dealt, "last dealt pack")?.clone();
        let evicted = self.bridge.evict_shown(&keep).await?;
        if evicted > 0 {
            log::debug!("Capacity trim removed {} shown cards before refill", evicted);
        }
        self.pipeline.acquire(self.pipeline.config().cap).await
    }
}
