//! Card records, session mirror state and pack requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::DEFAULT_PACK_SIZE;
use crate::error::{CacheError, Result};

/// Rarity tag assigned by the classifier at acquisition time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    UltraRare,
}

impl Rarity {
    /// Weighted-walk order, rarest first
    pub const DESCENDING: [Rarity; 4] = [
        Rarity::UltraRare,
        Rarity::Rare,
        Rarity::Uncommon,
        Rarity::Common,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::UltraRare => "ultra-rare",
        }
    }

    /// Parse a stored tag (e.g. "ultra-rare"); unknown tags are `None`
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "common" => Some(Rarity::Common),
            "uncommon" => Some(Rarity::Uncommon),
            "rare" => Some(Rarity::Rare),
            "ultra-rare" | "ultra_rare" | "ultrarare" => Some(Rarity::UltraRare),
            _ => None,
        }
    }

    /// Position in `DESCENDING`
    pub fn walk_index(&self) -> usize {
        match self {
            Rarity::UltraRare => 0,
            Rarity::Rare => 1,
            Rarity::Uncommon => 2,
            Rarity::Common => 3,
        }
    }
}

impl std::fmt::Display for Rarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate card supplied by the catalog, before its image is fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDescriptor {
    pub set_id: String,
    pub set_name: String,
    pub card_number: String,
    pub remote_image_ref: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Raw rarity label from the catalog, fed to the classifier
    #[serde(default)]
    pub rarity_label: Option<String>,
}

impl CardDescriptor {
    pub fn id(&self) -> String {
        CardRecord::id_for(&self.set_id, &self.card_number)
    }
}

/// One cached card: provenance, recompressed image and shown flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRecord {
    pub id: String,
    pub set_id: String,
    pub set_name: String,
    pub card_number: String,
    pub remote_image_ref: String,
    #[serde(with = "payload_base64")]
    pub compressed_payload: Vec<u8>,
    pub filename: String,
    pub rarity: Rarity,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub shown: bool,
}

impl CardRecord {
    /// Stable key `{setId}-{cardNumber}`
    pub fn id_for(set_id: &str, card_number: &str) -> String {
        format!("{}-{}", set_id, card_number)
    }

    /// Build a fresh (unshown) record for a descriptor whose image was fetched
    pub fn from_descriptor(descriptor: &CardDescriptor, rarity: Rarity, payload: Vec<u8>) -> Self {
        Self {
            id: descriptor.id(),
            set_id: descriptor.set_id.clone(),
            set_name: descriptor.set_name.clone(),
            card_number: descriptor.card_number.clone(),
            remote_image_ref: descriptor.remote_image_ref.clone(),
            compressed_payload: payload,
            filename: format!("{}_{}.jpg", descriptor.set_id, descriptor.card_number),
            rarity,
            acquired_at: Utc::now(),
            shown: false,
        }
    }

    pub fn summary(&self) -> CardSummary {
        CardSummary {
            id: self.id.clone(),
            set_id: self.set_id.clone(),
            set_name: self.set_name.clone(),
            card_number: self.card_number.clone(),
            filename: self.filename.clone(),
            rarity: self.rarity,
            acquired_at: self.acquired_at,
            shown: self.shown,
            payload_bytes: self.compressed_payload.len(),
        }
    }
}

/// Record without its payload, for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSummary {
    pub id: String,
    pub set_id: String,
    pub set_name: String,
    pub card_number: String,
    pub filename: String,
    pub rarity: Rarity,
    pub acquired_at: DateTime<Utc>,
    pub shown: bool,
    pub payload_bytes: usize,
}

/// Fast-tier projection of the durable store
///
/// `cards` is ordered newest first. `shown_ids` duplicates `CardRecord::shown`
/// so the mirror can answer "what is left" without touching the durable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub cards: Vec<CardRecord>,
    #[serde(default)]
    pub shown_ids: BTreeSet<String>,
    #[serde(default)]
    pub loading: bool,
    #[serde(default)]
    pub last_refill: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Project durable records (any order) into mirror shape
    pub fn from_records(mut records: Vec<CardRecord>) -> Self {
        records.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        let shown_ids = records
            .iter()
            .filter(|r| r.shown)
            .map(|r| r.id.clone())
            .collect();
        Self {
            cards: records,
            shown_ids,
            loading: false,
            last_refill: None,
        }
    }

    pub fn is_shown(&self, record: &CardRecord) -> bool {
        record.shown || self.shown_ids.contains(&record.id)
    }

    /// Put new records in front; an existing record with the same id is replaced
    pub fn prepend(&mut self, records: Vec<CardRecord>) {
        let incoming: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        self.cards.retain(|c| !incoming.contains(c.id.as_str()));
        let mut merged = records;
        merged.append(&mut self.cards);
        self.cards = merged;
    }

    pub fn mark_shown(&mut self, ids: &[String]) {
        for card in self.cards.iter_mut() {
            if ids.contains(&card.id) {
                card.shown = true;
            }
        }
        self.shown_ids.extend(ids.iter().cloned());
    }

    pub fn remove(&mut self, ids: &[String]) {
        self.cards.retain(|c| !ids.contains(&c.id));
        for id in ids {
            self.shown_ids.remove(id);
        }
    }

    pub fn unshown(&self) -> Vec<CardRecord> {
        self.cards
            .iter()
            .filter(|c| !self.is_shown(c))
            .cloned()
            .collect()
    }

    /// Shown cards still present in the mirror
    pub fn shown_count(&self) -> usize {
        self.cards.iter().filter(|c| self.is_shown(c)).count()
    }

    pub fn shown_card_ids(&self) -> Vec<String> {
        self.cards
            .iter()
            .filter(|c| self.is_shown(c))
            .map(|c| c.id.clone())
            .collect()
    }
}

/// Per-request pack parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackSpec {
    pub card_count: usize,
    pub rarity_weights: BTreeMap<Rarity, f64>,
    #[serde(default)]
    pub guaranteed_rare: bool,
}

impl Default for PackSpec {
    fn default() -> Self {
        Self::with_size(DEFAULT_PACK_SIZE)
    }
}

impl PackSpec {
    /// Default weights (5% ultra-rare, 15% rare, 30% uncommon, 50% common) with a guaranteed rare
    pub fn with_size(card_count: usize) -> Self {
        let rarity_weights = BTreeMap::from([
            (Rarity::UltraRare, 0.05),
            (Rarity::Rare, 0.15),
            (Rarity::Uncommon, 0.30),
            (Rarity::Common, 0.50),
        ]);
        Self {
            card_count,
            rarity_weights,
            guaranteed_rare: true,
        }
    }

    pub fn weight(&self, rarity: Rarity) -> f64 {
        self.rarity_weights.get(&rarity).copied().unwrap_or(0.0)
    }

    /// Reject negative or non-finite weights and weights that do not sum to 1.0
    pub fn validate(&self) -> Result<()> {
        let mut total = 0.0;
        for (rarity, weight) in &self.rarity_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(CacheError::InvalidPackSpec(format!(
                    "weight for {} must be a non-negative number, got {}",
                    rarity, weight
                )));
            }
            total += weight;
        }
        if (total - 1.0).abs() > 0.01 {
            return Err(CacheError::InvalidPackSpec(format!(
                "rarity weights must sum to 1.0, got {:.3}",
                total
            )));
        }
        Ok(())
    }

    /// `validate`, plus a pack may not ask for more cards than the cache holds
    pub fn validate_for_cap(&self, cap: usize) -> Result<()> {
        self.validate()?;
        if self.card_count > cap {
            return Err(CacheError::InvalidPackSpec(format!(
                "card count {} exceeds the cache ceiling of {}",
                self.card_count, cap
            )));
        }
        Ok(())
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Build a record with a tiny fake payload (test helper)
#[cfg(test)]
pub(crate) fn make_test_record(id: &str, rarity: Rarity) -> CardRecord {
    let (set_id, card_number) = id.split_once('-').unwrap_or((id, "1"));
    CardRecord {
        id: id.to_string(),
        set_id: set_id.to_string(),
        set_name: format!("Set {}", set_id),
        card_number: card_number.to_string(),
        remote_image_ref: format!("https://images.example.com/{}/{}.png", set_id, card_number),
        compressed_payload: vec![0xFF, 0xD8, 0xFF, id.len() as u8],
        filename: format!("{}_{}.jpg", set_id, card_number),
        rarity,
        acquired_at: Utc::now(),
        shown: false,
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
