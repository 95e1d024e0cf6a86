// =============================================================================
// dedup.rs — REPLAY GUARD FOR STREAM ENTRIES
// =============================================================================
//
// Redis redelivers an entry whenever its acknowledgement did not make it back
// (connection drop between handler success and XACK, restart while the ack
// was in flight). The handlers tolerate that, but re-running a 10k recipient
// batch pipeline just to find every record already terminal is wasted work.
//
// The guard remembers `(stream, entry id)` pairs that were handled and acked
// in this process:
//
// 1. The Bloom filter answers "definitely never seen" in O(k).
// 2. When it says "maybe", the LRU cache gives the definitive answer.
// 3. Once the filter has absorbed `expected_items` keys it is rebuilt from
//    the LRU contents, so it never saturates into "yes to everything".
//
// Lookup and insertion are separate calls. An entry is only remembered after
// its handler succeeded, a failed entry must stay unknown so the redelivery
// runs the handler again.
// =============================================================================

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, Ordering};
use std::num::NonZeroUsize;
use tracing::{debug, info};

const DEFAULT_LRU_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

pub struct ReplayGuard {
    bloom: RwLock<Bloom<String>>,
    lru_cache: Mutex<LruCache<String, ()>>,
    bloom_expected_items: u64,
    bloom_fp_rate: f64,
    /// Keys set into the current filter since it was last built.
    bloom_load: AtomicU64,
    pub stats: ReplayStats,
}

#[derive(Default)]
pub struct ReplayStats {
    pub checks: AtomicU64,
    pub replays: AtomicU64,
    pub remembered: AtomicU64,
    pub rebuilds: AtomicU64,
    /// Bloom said "maybe" and the LRU said no.
    pub bloom_false_positives: AtomicU64,
}

impl ReplayGuard {
    pub fn new(expected_items: u64, fp_rate: f64, lru_capacity: usize) -> Self {
        let expected_items = expected_items.max(1);
        let fp_rate = if fp_rate > 0.0 && fp_rate < 1.0 { fp_rate } else { 0.01 };
        info!(
            expected_items,
            fp_rate,
            lru_capacity,
            "Replay guard initialized"
        );

        Self {
            bloom: RwLock::new(Bloom::new_for_fp_rate(expected_items as usize, fp_rate)),
            lru_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(lru_capacity).unwrap_or(DEFAULT_LRU_CAPACITY),
            )),
            bloom_expected_items: expected_items,
            bloom_fp_rate: fp_rate,
            bloom_load: AtomicU64::new(0),
            stats: ReplayStats::default(),
        }
    }

    /// The key under which a stream entry is remembered.
    pub fn entry_key(stream: &str, entry_id: &str) -> String {
        format!("{stream}/{entry_id}")
    }

    /// Whether `key` was remembered earlier and is still in the cache.
    pub fn is_known(&self, key: &str) -> bool {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let key = key.to_string();

        if !self.bloom.read().check(&key) {
            return false;
        }

        if self.lru_cache.lock().get(&key).is_some() {
            self.stats.replays.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Replayed entry recognised");
            true
        } else {
            self.stats.bloom_false_positives.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn remember(&self, key: &str) {
        let key = key.to_string();
        self.bloom.write().set(&key);
        self.lru_cache.lock().put(key, ());
        self.stats.remembered.fetch_add(1, Ordering::Relaxed);

        if self.bloom_load.fetch_add(1, Ordering::Relaxed) + 1 >= self.bloom_expected_items {
            self.rebuild();
        }
    }

    /// Replace the filter with a fresh one seeded from the LRU contents.
    fn rebuild(&self) {
        let mut bloom = self.bloom.write();
        if self.bloom_load.load(Ordering::Relaxed) < self.bloom_expected_items {
            return;
        }

        let mut fresh = Bloom::new_for_fp_rate(self.bloom_expected_items as usize, self.bloom_fp_rate);
        let lru = self.lru_cache.lock();
        for (key, _) in lru.iter() {
            fresh.set(key);
        }
        *bloom = fresh;
        self.bloom_load.store(lru.len() as u64, Ordering::Relaxed);
        self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(seeded = lru.len(), "Replay guard filter rebuilt");
    }

    pub fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            checks: self.stats.checks.load(Ordering::Relaxed),
            replays: self.stats.replays.load(Ordering::Relaxed),
            remembered: self.stats.remembered.load(Ordering::Relaxed),
            filter_rebuilds: self.stats.rebuilds.load(Ordering::Relaxed),
            bloom_false_positives: self.stats.bloom_false_positives.load(Ordering::Relaxed),
            lru_cache_size: self.lru_cache.lock().len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplaySnapshot {
    pub checks: u64,
    pub replays: u64,
    pub remembered: u64,
    pub filter_rebuilds: u64,
    pub bloom_false_positives: u64,
    pub lru_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_until_remembered() {
        let guard = ReplayGuard::new(1000, 0.01, 100);
        let key = ReplayGuard::entry_key("campaign-batch-data", "1700000000000-0");
        assert!(!guard.is_known(&key));
        assert!(!guard.is_known(&key));
        guard.remember(&key);
        assert!(guard.is_known(&key));
        assert_eq!(guard.snapshot().replays, 1);
    }

    #[test]
    fn test_same_id_on_other_stream_is_distinct() {
        let guard = ReplayGuard::new(1000, 0.01, 100);
        guard.remember(&ReplayGuard::entry_key("insights", "1-0"));
        assert!(!guard.is_known(&ReplayGuard::entry_key("message-log", "1-0")));
    }

    #[test]
    fn test_rebuild_keeps_cached_keys() {
        let guard = ReplayGuard::new(4, 0.01, 3);
        for i in 0..10 {
            guard.remember(&format!("s/{i}-0"));
        }
        assert!(guard.snapshot().filter_rebuilds >= 1);
        assert!(guard.is_known("s/9-0"));
        assert!(guard.is_known("s/8-0"));
        assert!(!guard.is_known("s/0-0"));
    }
}
