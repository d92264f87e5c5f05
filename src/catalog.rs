//! Card catalog and rarity classification
//!
//! The catalog is a CSV manifest of available cards. Each row names a set,
//! a card number, an image URL and a free-form rarity label.

use rand::seq::IndexedRandom;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use crate::error::Result;
use crate::models::{CardDescriptor, Rarity};

/// Supplies candidate descriptors for acquisition
pub trait Catalog: Send + Sync {
    /// Up to `count` random descriptors without replacement, skipping ids in `exclude`.
    /// Fewer are returned when supply runs out.
    fn sample(&self, count: usize, exclude: &HashSet<String>) -> Vec<CardDescriptor>;
}

/// Maps catalog metadata to a rarity tag
pub trait RarityClassifier: Send + Sync {
    fn classify(&self, descriptor: &CardDescriptor) -> Rarity;
}

/// One manifest line
#[derive(Debug, Deserialize)]
struct ManifestRow {
    set_id: String,
    #[serde(default)]
    set_name: String,
    card_number: String,
    #[serde(default)]
    image_url: String,
    #[serde(default)]
    rarity: String,
    #[serde(default)]
    name: String,
}

/// In-memory catalog loaded from a CSV manifest
#[derive(Debug, Clone, Default)]
pub struct ManifestCatalog {
    descriptors: Vec<CardDescriptor>,
}

impl ManifestCatalog {
    pub fn from_descriptors(descriptors: Vec<CardDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn from_path(path: &Path, image_base_url: Option<&str>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let catalog = Self::from_reader(file, image_base_url)?;
        log::info!(
            "Loaded manifest {} with {} cards",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    /// Parse a manifest. Rows without an image URL get one derived from
    /// `image_base_url` (`{base}/{set_id}/{card_number}.png`) or are skipped.
    pub fn from_reader<R: Read>(reader: R, image_base_url: Option<&str>) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut descriptors = Vec::new();
        let mut seen = HashSet::new();
        for result in rdr.deserialize() {
            let row: ManifestRow = result?;
            if row.set_id.is_empty() || row.card_number.is_empty() {
                continue;
            }

            let remote_image_ref = if !row.image_url.is_empty() {
                row.image_url
            } else if let Some(base) = image_base_url {
                format!(
                    "{}/{}/{}.png",
                    base.trim_end_matches('/'),
                    row.set_id,
                    row.card_number
                )
            } else {
                log::debug!(
                    "Skipping manifest row {}-{} without image URL",
                    row.set_id,
                    row.card_number
                );
                continue;
            };

            let descriptor = CardDescriptor {
                set_name: if row.set_name.is_empty() {
                    row.set_id.clone()
                } else {
                    row.set_name
                },
                set_id: row.set_id,
                card_number: row.card_number,
                remote_image_ref,
                name: Some(row.name).filter(|n| !n.is_empty()),
                rarity_label: Some(row.rarity).filter(|r| !r.is_empty()),
            };
            if seen.insert(descriptor.id()) {
                descriptors.push(descriptor);
            }
        }

        Ok(Self { descriptors })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Catalog for ManifestCatalog {
    fn sample(&self, count: usize, exclude: &HashSet<String>) -> Vec<CardDescriptor> {
        let candidates: Vec<&CardDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| !exclude.contains(&d.id()))
            .collect();
        let mut rng = rand::rng();
        candidates
            .choose_multiple(&mut rng, count)
            .map(|d| (*d).clone())
            .collect()
    }
}

/// Keyword classifier over the catalog's rarity label
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelClassifier;

const ULTRA_RARE_KEYWORDS: [&str; 8] = [
    "ultra",
    "secret",
    "hyper",
    "rainbow",
    "illustration",
    "special",
    "amazing",
    "shiny",
];

impl LabelClassifier {
    pub fn classify_label(label: &str) -> Rarity {
        if let Some(rarity) = Rarity::from_tag(label) {
            return rarity;
        }
        let label = label.to_lowercase();
        if ULTRA_RARE_KEYWORDS.iter().any(|k| label.contains(k)) {
            Rarity::UltraRare
        } else if label.contains("uncommon") {
            Rarity::Uncommon
        } else if label.contains("rare") {
            Rarity::Rare
        } else {
            Rarity::Common
        }
    }
}

impl RarityClassifier for LabelClassifier {
    fn classify(&self, descriptor: &CardDescriptor) -> Rarity {
        descriptor
            .rarity_label
            .as_deref()
            .map(Self::classify_label)
            .unwrap_or(Rarity::Common)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "set_id,set_name,card_number,image_url,rarity,name
base1,Base,4,https://images.example.com/base1/4.png,Rare Holo,Charizard
base1,Base,58,https://images.example.com/base1/58.png,Common,Pikachu
base1,Base,58,https://images.example.com/base1/58.png,Common,Pikachu
sv3pt5,151,199,,Special Illustration Rare,Charizard ex
,Broken,1,https://x/1.png,Common,Nobody
";

    #[test]
    fn test_manifest_parses_and_dedupes() {
        let catalog = ManifestCatalog::from_reader(MANIFEST.as_bytes(), None).unwrap();
        // Duplicate row and row without set id dropped; row without URL skipped
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_manifest_derives_missing_image_url() {
        let catalog =
            ManifestCatalog::from_reader(MANIFEST.as_bytes(), Some("https://cdn.example.com/"))
                .unwrap();
        assert_eq!(catalog.len(), 3);

        let all = catalog.sample(10, &HashSet::new());
        let derived = all.iter().find(|d| d.set_id == "sv3pt5").unwrap();
        assert_eq!(
            derived.remote_image_ref,
            "https://cdn.example.com/sv3pt5/199.png"
        );
        assert_eq!(derived.name.as_deref(), Some("Charizard ex"));
    }

    #[test]
    fn test_manifest_from_path() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", MANIFEST).unwrap();
        let catalog = ManifestCatalog::from_path(file.path(), None).unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_sample_without_replacement_and_exclusion() {
        let descriptors: Vec<CardDescriptor> = (0..20)
            .map(|i| CardDescriptor {
                set_id: "s".to_string(),
                set_name: "S".to_string(),
                card_number: i.to_string(),
                remote_image_ref: format!("https://x/{}.png", i),
                name: None,
                rarity_label: None,
            })
            .collect();
        let catalog = ManifestCatalog::from_descriptors(descriptors);

        let exclude: HashSet<String> = (0..5).map(|i| format!("s-{}", i)).collect();
        let picked = catalog.sample(10, &exclude);
        assert_eq!(picked.len(), 10);

        let unique: HashSet<String> = picked.iter().map(|d| d.id()).collect();
        assert_eq!(unique.len(), 10);
        assert!(unique.is_disjoint(&exclude));

        // Asking for more than is left returns what remains
        assert_eq!(catalog.sample(100, &exclude).len(), 15);
    }

    #[test]
    fn test_label_classifier() {
        assert_eq!(LabelClassifier::classify_label("Common"), Rarity::Common);
        assert_eq!(LabelClassifier::classify_label("Uncommon"), Rarity::Uncommon);
        assert_eq!(LabelClassifier::classify_label("Rare Holo"), Rarity::Rare);
        assert_eq!(LabelClassifier::classify_label("Double Rare"), Rarity::Rare);
        assert_eq!(LabelClassifier::classify_label("Rare Secret"), Rarity::UltraRare);
        assert_eq!(
            LabelClassifier::classify_label("Special Illustration Rare"),
            Rarity::UltraRare
        );
        assert_eq!(LabelClassifier::classify_label("ultra-rare"), Rarity::UltraRare);
        assert_eq!(LabelClassifier::classify_label("Promo"), Rarity::Common);
    }

    #[test]
    fn test_classifier_defaults_to_common_without_label() {
        let descriptor = CardDescriptor {
            set_id: "s".to_string(),
            set_name: "S".to_string(),
            card_number: "1".to_string(),
            remote_image_ref: "https://x/1.png".to_string(),
            name: None,
            rarity_label: None,
        };
        assert_eq!(LabelClassifier.classify(&descriptor), Rarity::Common);
    }
}
