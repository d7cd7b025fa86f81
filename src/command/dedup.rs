//! Bounded membership set of already-handled object timestamps.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::frame::{timestamp_key, Timestamp};

pub const DEFAULT_DEDUP_HORIZON: f64 = 600.0;
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Timestamp → first-seen wall-clock time.
///
/// Entries leave the set once they are older than `horizon` seconds, or
/// oldest-first when more than `capacity` are held. A timestamp replayed
/// after eviction is treated as new.
pub struct DedupCache {
    inner: Mutex<Inner>,
    horizon: f64,
    capacity: usize,
}

#[derive(Default)]
struct Inner {
    seen: HashMap<u64, f64>,
    order: VecDeque<u64>,
}

impl DedupCache {
    pub fn new(horizon: f64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            horizon,
            capacity: capacity.max(1),
        }
    }

    /// Record `stamp` as seen at `now`. Returns false if it was already present.
    pub fn check_and_insert(&self, stamp: Timestamp, now: f64) -> bool {
        let key = timestamp_key(stamp);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.evict(now - self.horizon);
        if inner.seen.contains_key(&key) {
            return false;
        }
        inner.seen.insert(key, now);
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, stamp: Timestamp) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.seen.contains_key(&timestamp_key(stamp))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_HORIZON, DEFAULT_DEDUP_CAPACITY)
    }
}

impl Inner {
    /// Drop entries first seen before `cutoff`. Insertion order is also
    /// first-seen order, so only the front needs checking.
    fn evict(&mut self, cutoff: f64) {
        while let Some(&key) = self.order.front() {
            match self.seen.get(&key) {
                Some(&first_seen) if first_seen >= cutoff => break,
                _ => {
                    self.order.pop_front();
                    self.seen.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_sighting_is_rejected() {
        let cache = DedupCache::default();
        assert!(cache.check_and_insert(100.05, 1.0));
        assert!(!cache.check_and_insert(100.05, 2.0));
        assert!(cache.check_and_insert(100.06, 2.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entries_expire_after_horizon() {
        let cache = DedupCache::new(10.0, 100);
        assert!(cache.check_and_insert(1.0, 0.0));
        assert!(cache.check_and_insert(2.0, 5.0));
        assert!(!cache.check_and_insert(1.0, 9.0));
        // 1.0 was first seen at 0.0; by 10.5 it is beyond the horizon.
        assert!(cache.check_and_insert(1.0, 10.5));
        assert!(cache.contains(2.0));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = DedupCache::new(1e9, 3);
        for t in 0..5 {
            assert!(cache.check_and_insert(t as f64, 0.0));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(0.0));
        assert!(!cache.contains(1.0));
        assert!(cache.contains(4.0));
    }

    #[test]
    fn concurrent_inserts_admit_each_stamp_once() {
        let cache = Arc::new(DedupCache::default());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || (0..100).filter(|t| cache.check_and_insert(*t as f64, 0.0)).count())
            })
            .collect();
        let admitted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
