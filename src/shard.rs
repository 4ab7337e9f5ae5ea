//! A single shard: one lock guarding a key→entry map and a fingerprint→key
//! map, plus its own hit/miss counters.
//!
//! Fingerprint collisions are treated as identity by the policy above this
//! layer; this is where that's reconciled against real keys. When a new
//! key collides with an existing fingerprint, the previous holder is
//! evicted first so the two maps never disagree.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A shard-resident entry. `expire_ns == 0` means no expiration.
#[derive(Clone)]
pub struct Entry<V> {
    pub value: V,
    pub expire_ns: u64,
}

struct Inner<K, V> {
    by_key: HashMap<K, Entry<V>>,
    key_by_fp: HashMap<u64, K>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self { by_key: HashMap::new(), key_by_fp: HashMap::new() }
    }
}

/// One striped slice of the cache's key space.
pub struct Shard<K, V> {
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> Default for Shard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, returning its value if present and not expired as of
    /// `now_ns`. A present-but-expired entry is evicted on the spot rather
    /// than left for maintenance to find later.
    pub fn get(&self, key: &K, fp: u64, now_ns: u64) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.by_key.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.expire_ns != 0 && entry.expire_ns <= now_ns,
        };
        if expired {
            inner.by_key.remove(key);
            if inner.key_by_fp.get(&fp) == Some(key) {
                inner.key_by_fp.remove(&fp);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.by_key.get(key).map(|e| e.value.clone())
    }

    /// Inserts or overwrites `key`, reconciling any fingerprint collision
    /// with a previous, different key first.
    pub fn set(&self, key: K, fp: u64, value: V, expire_ns: u64) {
        let mut inner = self.inner.lock();
        if let Some(prev_key) = inner.key_by_fp.get(&fp) {
            if prev_key != &key {
                let prev_key = prev_key.clone();
                inner.by_key.remove(&prev_key);
            }
        }
        inner.key_by_fp.insert(fp, key.clone());
        inner.by_key.insert(key, Entry { value, expire_ns });
    }

    /// Removes `key` (and its fingerprint mapping), returning whether it
    /// was present.
    pub fn remove(&self, key: &K, fp: u64) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner.by_key.remove(key).is_some();
        if inner.key_by_fp.get(&fp) == Some(key) {
            inner.key_by_fp.remove(&fp);
        }
        existed
    }

    /// Removes by fingerprint alone (used for policy-driven eviction and
    /// explicit deletes, where only the fingerprint is known and the
    /// removal is unconditional).
    pub fn remove_by_fingerprint(&self, fp: u64) {
        let mut inner = self.inner.lock();
        if let Some(key) = inner.key_by_fp.remove(&fp) {
            inner.by_key.remove(&key);
        }
    }

    /// Removes `fp` only if it is still present *and* still actually
    /// expired as of `now_ns`. A timer-wheel deadline can outlive a later
    /// `set` that renewed the same fingerprint's TTL before the wheel's
    /// notification was processed; rechecking liveness here is what keeps
    /// that race from deleting a live entry.
    pub fn remove_expired(&self, fp: u64, now_ns: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(key) = inner.key_by_fp.get(&fp).cloned() else {
            return false;
        };
        let still_expired = match inner.by_key.get(&key) {
            Some(entry) => entry.expire_ns != 0 && entry.expire_ns <= now_ns,
            None => false,
        };
        if !still_expired {
            return false;
        }
        inner.by_key.remove(&key);
        inner.key_by_fp.remove(&fp);
        true
    }

    /// Updates `key`'s expiration in place, leaving its value untouched.
    /// No-op if `key` is absent. `expire_ns` is an absolute deadline (`0`
    /// meaning never expire), matching the convention `set` already uses
    /// for the same field rather than a duration relative to now.
    pub fn set_ttl(&self, key: &K, expire_ns: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.by_key.get_mut(key) {
            entry.expire_ns = expire_ns;
        }
    }

    /// Drops every entry whose `expire_ns` is non-zero and `<= now_ns`.
    /// A full-shard resilience sweep on top of the spec's per-fingerprint
    /// `remove_expired`, catching anything the timer wheel never reported
    /// (e.g. a node that was never re-inserted after a crash-free restart).
    pub fn sweep_expired(&self, now_ns: u64) {
        let mut inner = self.inner.lock();
        let expired_keys: Vec<K> = inner
            .by_key
            .iter()
            .filter(|(_, e)| e.expire_ns != 0 && e.expire_ns <= now_ns)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired_keys {
            inner.by_key.remove(&key);
            inner.key_by_fp.retain(|_, k| k != &key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_key.clear();
        inner.key_by_fp.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_miss_then_set_then_hit() {
        let s: Shard<&str, i32> = Shard::new();
        assert_eq!(s.get(&"a", 1, 0), None);
        s.set("a", 1, 42, 0);
        assert_eq!(s.get(&"a", 1, 0), Some(42));
        assert_eq!(s.hits(), 1);
        assert_eq!(s.misses(), 1);
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 42, 100);
        assert_eq!(s.get(&"a", 1, 50), Some(42));
        assert_eq!(s.get(&"a", 1, 150), None);
    }

    #[test]
    fn expired_read_evicts_the_entry() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 42, 100);
        assert_eq!(s.get(&"a", 1, 150), None);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn fingerprint_collision_evicts_previous_holder() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 1, 0);
        s.set("b", 1, 2, 0);
        assert_eq!(s.get(&"a", 1, 0), None);
        assert_eq!(s.get(&"b", 1, 0), Some(2));
    }

    #[test]
    fn sweep_expired_drops_only_elapsed_entries() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 1, 100);
        s.set("b", 2, 2, 0);
        s.sweep_expired(150);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(&"b", 2, 150), Some(2));
    }

    #[test]
    fn remove_expired_is_a_noop_on_a_renewed_entry() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 42, 100);
        // The entry was renewed with a later deadline before the
        // notification for the old deadline was processed.
        s.set("a", 1, 42, 500);
        assert!(!s.remove_expired(1, 150));
        assert_eq!(s.get(&"a", 1, 150), Some(42));
    }

    #[test]
    fn remove_expired_removes_a_genuinely_expired_entry() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 42, 100);
        assert!(s.remove_expired(1, 150));
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn remove_expired_is_a_noop_on_an_absent_fingerprint() {
        let s: Shard<&str, i32> = Shard::new();
        assert!(!s.remove_expired(99, 150));
    }

    #[test]
    fn set_ttl_updates_expiration_in_place() {
        let s: Shard<&str, i32> = Shard::new();
        s.set("a", 1, 42, 0);
        s.set_ttl(&"a", 50);
        assert_eq!(s.get(&"a", 1, 10), Some(42));
        assert_eq!(s.get(&"a", 1, 60), None);
    }

    #[test]
    fn set_ttl_is_a_noop_when_key_is_absent() {
        let s: Shard<&str, i32> = Shard::new();
        s.set_ttl(&"missing", 50);
        assert_eq!(s.len(), 0);
    }
}
