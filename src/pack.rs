//! Rarity-weighted pack generation
//!
//! Partition the unshown pool by rarity, optionally reserve one slot for a
//! rare, then fill the remaining slots with a weighted walk from ultra-rare
//! down to common. An empty bucket falls through to the next lower rarity
//! with members left, so a scarce tier shortens nothing as long as the pool
//! still has cards.

use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;

use crate::models::{CardRecord, PackSpec, Rarity};

/// Chance that the guaranteed slot is served from ultra-rare instead of rare
pub const GUARANTEED_ULTRA_CHANCE: f64 = 0.10;

/// A dealt pack, in draw order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    pub cards: Vec<CardRecord>,
    pub requested: usize,
}

impl Pack {
    /// True when supply ran out before every slot was filled
    pub fn is_short(&self) -> bool {
        self.cards.len() < self.requested
    }

    pub fn ids(&self) -> Vec<String> {
        self.cards.iter().map(|c| c.id.clone()).collect()
    }
}

/// Unselected members per rarity, indexed by `Rarity::walk_index`
struct Buckets<'a> {
    slots: [Vec<&'a CardRecord>; 4],
}

impl<'a> Buckets<'a> {
    fn partition(pool: &'a [CardRecord]) -> Self {
        let mut slots: [Vec<&CardRecord>; 4] = Default::default();
        let mut seen = HashSet::new();
        for record in pool {
            if seen.insert(record.id.as_str()) {
                slots[record.rarity.walk_index()].push(record);
            }
        }
        Self { slots }
    }

    fn has(&self, rarity: Rarity) -> bool {
        !self.slots[rarity.walk_index()].is_empty()
    }

    /// Remove and return a uniformly chosen member
    fn take<R: Rng>(&mut self, rarity: Rarity, rng: &mut R) -> Option<&'a CardRecord> {
        let bucket = &mut self.slots[rarity.walk_index()];
        if bucket.is_empty() {
            return None;
        }
        let index = rng.random_range(0..bucket.len());
        Some(bucket.swap_remove(index))
    }

    /// First rarity with members at or below `start` in walk order, then above it
    fn fall_through(&self, start: Rarity) -> Option<Rarity> {
        let index = start.walk_index();
        Rarity::DESCENDING[index..]
            .iter()
            .chain(Rarity::DESCENDING[..index].iter().rev())
            .copied()
            .find(|r| self.has(*r))
    }
}

/// Pick the bucket a uniform draw `r` in [0, 1) lands in
fn weighted_pick(spec: &PackSpec, r: f64) -> Rarity {
    let mut cumulative = 0.0;
    for rarity in Rarity::DESCENDING {
        cumulative += spec.weight(rarity);
        if r < cumulative {
            return rarity;
        }
    }
    // Weights summing slightly under 1.0
    Rarity::Common
}

fn guaranteed_pick<R: Rng>(buckets: &Buckets<'_>, rng: &mut R) -> Option<Rarity> {
    let roll: f64 = rng.random();
    if roll < GUARANTEED_ULTRA_CHANCE && buckets.has(Rarity::UltraRare) {
        Some(Rarity::UltraRare)
    } else if buckets.has(Rarity::Rare) {
        Some(Rarity::Rare)
    } else if buckets.has(Rarity::UltraRare) {
        Some(Rarity::UltraRare)
    } else {
        None
    }
}

/// Draw a pack from `pool`. Never fails: scarce supply yields a short pack.
pub fn generate_pack<R: Rng>(pool: &[CardRecord], spec: &PackSpec, rng: &mut R) -> Pack {
    let mut buckets = Buckets::partition(pool);
    let mut cards = Vec::with_capacity(spec.card_count.min(pool.len()));

    if spec.guaranteed_rare && spec.card_count > 0 {
        match guaranteed_pick(&buckets, rng).and_then(|r| buckets.take(r, rng)) {
            Some(card) => cards.push(card.clone()),
            None => log::debug!("No rare or ultra-rare in pool, guaranteed slot skipped"),
        }
    }

    while cards.len() < spec.card_count {
        let target = weighted_pick(spec, rng.random::<f64>());
        // Fallthrough only comes back empty once every bucket is drained
        match buckets
            .fall_through(target)
            .and_then(|r| buckets.take(r, rng))
        {
            Some(card) => cards.push(card.clone()),
            None => break,
        }
    }

    if cards.len() < spec.card_count {
        log::info!(
            "Pool exhausted: dealt {} of {} cards",
            cards.len(),
            spec.card_count
        );
    }

    Pack {
        cards,
        requested: spec.card_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::make_test_record;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn pool(ultra: usize, rare: usize, uncommon: usize, common: usize) -> Vec<CardRecord> {
        let mut pool = Vec::new();
        for (prefix, rarity, n) in [
            ("u", Rarity::UltraRare, ultra),
            ("r", Rarity::Rare, rare),
            ("n", Rarity::Uncommon, uncommon),
            ("c", Rarity::Common, common),
        ] {
            for i in 0..n {
                pool.push(make_test_record(&format!("{}-{}", prefix, i), rarity));
            }
        }
        pool
    }

    fn count(pack: &Pack, rarity: Rarity) -> usize {
        pack.cards.iter().filter(|c| c.rarity == rarity).count()
    }

    #[test]
    fn test_weighted_pick_walks_rarest_first() {
        let spec = PackSpec::default();
        assert_eq!(weighted_pick(&spec, 0.0), Rarity::UltraRare);
        assert_eq!(weighted_pick(&spec, 0.049), Rarity::UltraRare);
        assert_eq!(weighted_pick(&spec, 0.05), Rarity::Rare);
        assert_eq!(weighted_pick(&spec, 0.19), Rarity::Rare);
        assert_eq!(weighted_pick(&spec, 0.2), Rarity::Uncommon);
        assert_eq!(weighted_pick(&spec, 0.5), Rarity::Common);
        assert_eq!(weighted_pick(&spec, 0.9999), Rarity::Common);
    }

    #[test]
    fn test_no_duplicates_within_pack() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = pool(3, 3, 3, 3);
        for _ in 0..500 {
            let pack = generate_pack(&pool, &PackSpec::with_size(10), &mut rng);
            let unique: HashSet<&str> = pack.cards.iter().map(|c| c.id.as_str()).collect();
            assert_eq!(unique.len(), pack.cards.len());
            assert_eq!(pack.cards.len(), 10);
        }
    }

    #[test]
    fn test_duplicate_ids_in_pool_are_dealt_once() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pool = pool(0, 0, 0, 2);
        pool.push(pool[0].clone());
        let pack = generate_pack(&pool, &PackSpec::with_size(8), &mut rng);
        assert_eq!(pack.cards.len(), 2);
        assert!(pack.is_short());
    }

    #[test]
    fn test_distribution_converges_to_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let pool = pool(100, 100, 100, 100);
        let mut spec = PackSpec::with_size(8);
        spec.guaranteed_rare = false;

        let mut tally: HashMap<Rarity, usize> = HashMap::new();
        let mut total = 0;
        for _ in 0..10_000 {
            let pack = generate_pack(&pool, &spec, &mut rng);
            for card in &pack.cards {
                *tally.entry(card.rarity).or_default() += 1;
                total += 1;
            }
        }

        for rarity in Rarity::DESCENDING {
            let observed = tally.get(&rarity).copied().unwrap_or(0) as f64 / total as f64;
            let expected = spec.weight(rarity);
            assert!(
                (observed - expected).abs() < 0.02,
                "{}: observed {:.4}, expected {:.2}",
                rarity,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_empty_bucket_falls_through_to_lower_rarity() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut spec = PackSpec::with_size(5);
        spec.guaranteed_rare = false;
        spec.rarity_weights.insert(Rarity::UltraRare, 0.0);
        spec.rarity_weights.insert(Rarity::Rare, 1.0);
        spec.rarity_weights.insert(Rarity::Uncommon, 0.0);
        spec.rarity_weights.insert(Rarity::Common, 0.0);

        // Every draw targets rare, which is empty
        let pack = generate_pack(&pool(0, 0, 2, 10), &spec, &mut rng);
        assert_eq!(pack.cards.len(), 5);
        assert_eq!(count(&pack, Rarity::Uncommon), 2);
        assert_eq!(count(&pack, Rarity::Common), 3);
    }

    #[test]
    fn test_only_rarer_cards_left_are_still_dealt() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut spec = PackSpec::with_size(3);
        spec.guaranteed_rare = false;
        let pack = generate_pack(&pool(1, 2, 0, 0), &spec, &mut rng);
        assert_eq!(pack.cards.len(), 3);
    }

    #[test]
    fn test_short_pack_when_pool_runs_out() {
        let mut rng = StdRng::seed_from_u64(9);
        let pack = generate_pack(&pool(0, 1, 1, 1), &PackSpec::with_size(8), &mut rng);
        assert_eq!(pack.cards.len(), 3);
        assert!(pack.is_short());

        let empty = generate_pack(&[], &PackSpec::with_size(8), &mut rng);
        assert!(empty.cards.is_empty());
    }

    #[test]
    fn test_huge_card_count_deals_the_pool_and_stops() {
        let mut rng = StdRng::seed_from_u64(13);
        let pack = generate_pack(&pool(0, 0, 0, 1), &PackSpec::with_size(usize::MAX), &mut rng);
        assert_eq!(pack.cards.len(), 1);
        assert_eq!(pack.requested, usize::MAX);
        assert!(pack.is_short());

        let pack = generate_pack(&pool(1, 1, 1, 1), &PackSpec::with_size(usize::MAX), &mut rng);
        assert_eq!(pack.cards.len(), 4);
    }

    #[test]
    fn test_guaranteed_slot_prefers_rare() {
        let mut rng = StdRng::seed_from_u64(11);
        let pool = pool(0, 5, 0, 50);
        for _ in 0..200 {
            let pack = generate_pack(&pool, &PackSpec::with_size(8), &mut rng);
            assert_eq!(pack.cards[0].rarity, Rarity::Rare);
        }
    }

    #[test]
    fn test_guaranteed_slot_falls_back_to_ultra_rare() {
        // 1 ultra-rare, no rares, 5 uncommon, 20 common
        let mut rng = StdRng::seed_from_u64(13);
        let pool = pool(1, 0, 5, 20);
        for _ in 0..200 {
            let pack = generate_pack(&pool, &PackSpec::with_size(8), &mut rng);
            assert_eq!(pack.cards.len(), 8);
            assert_eq!(pack.cards[0].rarity, Rarity::UltraRare);
            assert_eq!(count(&pack, Rarity::UltraRare), 1);
            assert_eq!(count(&pack, Rarity::Rare), 0);
            assert_eq!(
                count(&pack, Rarity::Uncommon) + count(&pack, Rarity::Common),
                7
            );
        }
    }

    #[test]
    fn test_guaranteed_slot_skipped_without_rares() {
        let mut rng = StdRng::seed_from_u64(17);
        let pack = generate_pack(&pool(0, 0, 0, 4), &PackSpec::with_size(8), &mut rng);
        assert_eq!(pack.cards.len(), 4);
        assert_eq!(count(&pack, Rarity::Common), 4);
    }

    #[test]
    fn test_guaranteed_ultra_rate_is_about_ten_percent() {
        let mut rng = StdRng::seed_from_u64(19);
        let pool = pool(50, 50, 0, 0);
        let mut spec = PackSpec::with_size(1);
        spec.guaranteed_rare = true;

        let trials = 10_000;
        let ultra = (0..trials)
            .filter(|_| generate_pack(&pool, &spec, &mut rng).cards[0].rarity == Rarity::UltraRare)
            .count();
        let ratio = ultra as f64 / trials as f64;
        assert!((ratio - GUARANTEED_ULTRA_CHANCE).abs() < 0.02, "ratio {}", ratio);
    }
}
