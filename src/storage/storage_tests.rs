//! Tests for the tier storage adapter

use super::*;
use crate::error::Result;
use crate::models::{make_test_record, Rarity};
use std::sync::atomic::AtomicBool;

/// Backend that can be switched into a failing state
struct FlakyBackend {
    inner: MemoryBackend,
    failing: Arc<AtomicBool>,
}

impl FlakyBackend {
    fn new(failing: bool) -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(failing));
        (
            Self {
                inner: MemoryBackend::new(),
                failing: Arc::clone(&flag),
            },
            flag,
        )
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::StorageUnavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

impl KvBackend for FlakyBackend {
    fn kind(&self) -> TierKind {
        TierKind::File
    }
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set(key, value)
    }
    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key)
    }
    fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        self.inner.keys()
    }
}

fn session_with(count: usize, shown: usize) -> SessionState {
    let mut state = SessionState::default();
    state.prepend(
        (0..count)
            .map(|i| make_test_record(&format!("s-{}", i), Rarity::Common))
            .collect(),
    );
    let shown_ids: Vec<String> = (0..shown).map(|i| format!("s-{}", i)).collect();
    state.mark_shown(&shown_ids);
    state
}

fn json_len(state: &SessionState) -> u64 {
    serde_json::to_string(state).unwrap().len() as u64
}

#[test]
fn test_init_picks_first_passing_candidate() {
    let (failing, _) = FlakyBackend::new(true);
    let storage = TierStorage::init(vec![
        Box::new(failing),
        Box::new(SqliteKvBackend::open_in_memory().unwrap()),
        Box::new(MemoryBackend::new()),
    ]);
    assert_eq!(storage.active_tier(), TierKind::Sqlite);
    assert!(!storage.is_degraded());
}

#[test]
fn test_init_falls_back_to_memory_when_all_fail() {
    let (a, _) = FlakyBackend::new(true);
    let storage = TierStorage::init(vec![Box::new(a)]);
    assert_eq!(storage.active_tier(), TierKind::Memory);
    assert!(storage.is_degraded());

    // Degraded mode still works within the process
    assert!(storage.set_item("pack_cache.flag", "1"));
    assert_eq!(storage.get_item("pack_cache.flag").as_deref(), Some("1"));
}

#[test]
fn test_open_default_prefers_file_tier() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let storage = TierStorage::open_default(temp_dir.path(), 1024 * 1024);
    assert_eq!(storage.active_tier(), TierKind::File);
    assert!(storage.estimate_usage().is_some());
}

#[test]
fn test_failures_are_reported_not_raised() {
    let (flaky, flag) = FlakyBackend::new(false);
    let storage = TierStorage::init(vec![Box::new(flaky)]);
    assert!(storage.set_item("pack_cache.a", "1"));

    flag.store(true, Ordering::SeqCst);
    assert!(storage.get_item("pack_cache.a").is_none());
    assert!(!storage.set_item("pack_cache.a", "2"));
    assert!(!storage.remove_item("pack_cache.a"));
    assert_eq!(storage.remove_prefixed(KEY_PREFIX), 0);
    // A plain failure is not a quota problem: no demotion
    assert_eq!(storage.active_tier(), TierKind::File);
}

#[test]
fn test_session_round_trip() {
    let storage = TierStorage::in_memory();
    assert!(storage.read_session().is_none());

    let state = session_with(3, 1);
    assert!(storage.write_session(&state));
    assert_eq!(storage.read_session().unwrap(), state);
}

#[test]
fn test_unreadable_session_is_discarded() {
    let storage = TierStorage::in_memory();
    storage.set_item(SESSION_KEY, "not json");
    assert!(storage.read_session().is_none());
}

#[test]
fn test_quota_recovery_drops_shown_records_first() {
    let full = session_with(60, 20);
    let after_drop = Eviction::DropShown.apply(full.clone());
    let quota = json_len(&after_drop) + 16;
    assert!(json_len(&full) > quota);

    let storage = TierStorage::init(vec![Box::new(MemoryBackend::with_quota(quota))]);
    assert!(storage.write_session(&full));

    let stored = storage.read_session().unwrap();
    assert_eq!(stored.cards.len(), 40);
    assert_eq!(stored.shown_count(), 0);
    assert!(!storage.is_degraded());
}

#[test]
fn test_quota_recovery_walks_down_to_ten_records() {
    let full = session_with(60, 0);
    let ten = Eviction::KeepRecent(10).apply(full.clone());
    let quota = json_len(&ten) + 16;

    let storage = TierStorage::init(vec![Box::new(MemoryBackend::with_quota(quota))]);
    assert!(storage.write_session(&full));

    let stored = storage.read_session().unwrap();
    assert_eq!(stored.cards.len(), 10);
    assert_eq!(stored.cards[0].id, "s-0");
}

#[test]
fn test_quota_exhaustion_returns_false_and_demotes() {
    let storage = TierStorage::init(vec![Box::new(MemoryBackend::with_quota(64))]);
    assert!(!storage.is_degraded());

    let full = session_with(20, 0);
    assert!(!storage.write_session(&full));

    assert!(storage.is_degraded());
    assert_eq!(storage.active_tier(), TierKind::Memory);
    // The unbounded map now holds the value
    assert_eq!(storage.read_session().unwrap().cards.len(), 20);
    assert!(storage.estimate_usage().is_none());
}

#[test]
fn test_copy_entries_reports_what_did_not_fit() {
    let from = MemoryBackend::new();
    from.set("pack_cache.a", "1234").unwrap();
    from.set("pack_cache.b", "5678").unwrap();
    from.set("pack_cache.c", "90").unwrap();

    // Room for four bytes: some writes are refused and must not count
    let to = MemoryBackend::with_quota(4);
    let copied = copy_entries(&from, &to);
    let landed = to.keys().unwrap();
    assert_eq!(copied, landed.len());
    assert!(copied < 3);

    let unbounded = MemoryBackend::new();
    assert_eq!(copy_entries(&from, &unbounded), 3);

    let (down, _) = FlakyBackend::new(true);
    assert_eq!(copy_entries(&down, &MemoryBackend::new()), 0);
}

#[test]
fn test_quota_on_other_key_shrinks_the_mirror() {
    let full = session_with(30, 15);
    let after_drop = Eviction::DropShown.apply(full.clone());
    let freed = (json_len(&full) - json_len(&after_drop)) as usize;
    let quota = json_len(&full) + 16;

    let storage = TierStorage::init(vec![Box::new(MemoryBackend::with_quota(quota))]);
    assert!(storage.write_session(&full));
    assert_eq!(storage.read_session().unwrap().cards.len(), 30);

    // Only fits once the shown half of the mirror is gone
    let extra = "x".repeat(freed);
    assert!(storage.set_item("pack_cache.extra", &extra));
    assert_eq!(storage.read_session().unwrap().cards.len(), 15);
    assert_eq!(storage.get_item("pack_cache.extra").unwrap(), extra);
    assert!(!storage.is_degraded());
}

#[test]
fn test_remove_prefixed_only_touches_prefix() {
    let storage = TierStorage::in_memory();
    storage.set_item("pack_cache.session", "{}");
    storage.set_item("pack_cache.last_refill", "now");
    storage.set_item("other.key", "keep");

    assert_eq!(storage.remove_prefixed(KEY_PREFIX), 2);
    assert!(storage.get_item("pack_cache.session").is_none());
    assert_eq!(storage.get_item("other.key").as_deref(), Some("keep"));
}
