//! Pack Cache - card pack engine
//!
//! Acquires a bounded working set of card images from a remote source,
//! keeps it in a durable SQLite store mirrored into a fast storage tier,
//! tracks which cards have been shown and deals rarity-weighted packs.

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod images;
pub mod models;
pub mod pack;
pub mod pipeline;
pub mod storage;
pub mod tracker;
pub mod web;

pub use bridge::{CacheBridge, SyncView};
pub use catalog::{Catalog, LabelClassifier, ManifestCatalog, RarityClassifier};
pub use config::EngineConfig;
pub use database::RecordStore;
pub use engine::{EngineStatus, PackEngine};
pub use error::{CacheError, Result};
pub use images::{compress_card_image, ImageFetcher};
pub use models::{CardDescriptor, CardRecord, CardSummary, PackSpec, Rarity, SessionState};
pub use pack::{generate_pack, Pack};
pub use pipeline::{plan_batch, AcquisitionPipeline, AcquisitionReport};
pub use storage::{TierKind, TierStorage};
pub use tracker::{AcquisitionGuard, RefillDecision, ShownTracker};
