//! The public cache facade: wires shards, the read/write buffers, the
//! policy and the maintenance task together behind a small `get`/`set`/
//! `delete`/`clear`/`close` surface.

use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CacheBuilder;
use crate::error::CacheError;
use crate::hash::fingerprint;
use crate::maintenance::{self, MaintenanceHandle, MaintenanceTarget};
use crate::policy::Policy;
use crate::read_buffer::ReadBuffer;
use crate::shards::Shards;
use crate::stats::Stats;
use crate::write_buffer::{self, WriteBuffer};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_nanos() as u64
}

struct Inner<K, V> {
    shards: Shards<K, V>,
    read_buffer: ReadBuffer,
    write_buffer: WriteBuffer,
    policy: Mutex<Policy>,
    nolock: bool,
    state: AtomicU8,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn apply_write_records(&self, policy: &mut Policy, records: Vec<(u64, i64)>) {
        let now = now_ns();
        for (fp, ttl_field) in records {
            if ttl_field == write_buffer::DELETE {
                policy.delete(fp);
                self.shards.shard_for(fp).remove_by_fingerprint(fp);
            } else {
                let ttl_ns = if ttl_field == write_buffer::NO_TTL { 0 } else { ttl_field as u64 };
                for victim_fp in policy.set(fp, ttl_ns, now) {
                    self.shards.shard_for(victim_fp).remove_by_fingerprint(victim_fp);
                }
            }
        }
    }

    fn drain_write_buffer_opportunistic(&self) {
        if self.write_buffer.is_empty() {
            return;
        }
        if let Some(mut policy) = self.policy.try_lock() {
            let records = self.write_buffer.take_all();
            self.apply_write_records(&mut policy, records);
        }
    }

    fn drain_write_buffer_forced(&self) {
        let mut policy = self.policy.lock();
        let records = self.write_buffer.take_all();
        self.apply_write_records(&mut policy, records);
    }

    fn stage_write(&self, fp: u64, ttl_field: i64) {
        let full = self.write_buffer.stage(fp, ttl_field);
        if full {
            self.drain_write_buffer_forced();
        } else {
            self.drain_write_buffer_opportunistic();
        }
    }

    fn record_read(&self, fp: u64) {
        let batch = if self.nolock {
            self.read_buffer.record_blocking(fp)
        } else {
            self.read_buffer.record(fp)
        };
        if let Some(batch) = batch {
            self.policy.lock().access(&batch);
        }
    }
}

impl<K, V> MaintenanceTarget for Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn run_once(&self, now_ns: u64) {
        let expired = self.policy.lock().advance(now_ns);
        for fp in expired {
            // Liveness-checked: a `set` that renewed this fingerprint's TTL
            // after the wheel computed this deadline, but before this tick
            // ran, must not have its fresh entry deleted here.
            self.shards.shard_for(fp).remove_expired(fp, now_ns);
        }
        self.shards.sweep_expired(now_ns);
    }
}

/// A concurrent, bounded, TTL-aware cache using Window-TinyLFU admission.
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: u64) -> Self {
        Self::from_builder(CacheBuilder::new(capacity))
    }

    pub fn builder(capacity: u64) -> CacheBuilder {
        CacheBuilder::new(capacity)
    }

    pub(crate) fn from_builder(builder: CacheBuilder) -> Self {
        let shard_count = builder.shard_count.unwrap_or_else(crate::shards::default_shard_count);

        info!(
            component = "cache",
            event = "construct",
            capacity = builder.capacity,
            shard_count,
            nolock = builder.nolock
        );

        let inner = Arc::new(Inner {
            shards: Shards::new(shard_count),
            read_buffer: ReadBuffer::new(),
            write_buffer: WriteBuffer::new(),
            policy: Mutex::new(Policy::new(builder.capacity)),
            nolock: builder.nolock,
            state: AtomicU8::new(OPEN),
        });

        let maintenance = maintenance::spawn(inner.clone(), MAINTENANCE_INTERVAL, now_ns);

        Self { inner, maintenance: Mutex::new(Some(maintenance)) }
    }

    fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }

    /// Looks up `key`. Returns `(value, hit)`: `hit` is `true` exactly when
    /// `value` is `Some`. Closing the cache does not disable lookups; only
    /// the background maintenance task stops.
    pub fn get(&self, key: &K) -> (Option<V>, bool) {
        let fp = fingerprint(key);
        let value = self.inner.shards.shard_for(fp).get(key, fp, now_ns());
        let hit = value.is_some();
        // Closing stops the maintenance sweep, not reads; but a closed
        // cache also stops feeding its own buffers, since nothing will
        // ever drain them proactively again.
        if hit && !self.is_closed() {
            self.inner.record_read(fp);
        }
        (value, hit)
    }

    /// Inserts `key` with no expiration.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, None).expect("no-ttl set cannot fail validation");
    }

    /// Inserts `key` with an optional TTL. `Some(Duration::ZERO)` (or any
    /// other non-positive duration, which `Duration` cannot represent) is
    /// rejected; omit the TTL entirely for "never expires".
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl_ns: u64 = match ttl {
            None => 0,
            Some(d) if d.is_zero() => return Err(CacheError::InvalidTtl),
            Some(d) => d.as_nanos().min(u64::MAX as u128) as u64,
        };

        let fp = fingerprint(&key);
        let now = now_ns();
        let expire_ns = if ttl_ns == 0 { 0 } else { now.saturating_add(ttl_ns) };
        self.inner.shards.shard_for(fp).set(key, fp, value, expire_ns);
        self.inner
            .stage_write(fp, if ttl_ns == 0 { write_buffer::NO_TTL } else { ttl_ns as i64 });
        Ok(())
    }

    /// Removes `key`, returning whether it was present. Behaves identically
    /// whether or not the cache has been closed.
    pub fn delete(&self, key: &K) -> bool {
        let fp = fingerprint(key);
        let existed = self.inner.shards.shard_for(fp).remove(key, fp);
        self.inner.stage_write(fp, write_buffer::DELETE);
        existed
    }

    /// Drops every entry and resets all counters and buffers.
    pub fn clear(&self) {
        self.inner.shards.clear();
        self.inner.read_buffer.drain_all();
        self.inner.write_buffer.take_all();
        self.inner.policy.lock().clear();
    }

    /// Forces both buffers to drain into the policy immediately, bypassing
    /// the normal lossy/opportunistic timing. Intended for tests and
    /// operational diagnostics, not hot-path use.
    pub fn force_drain(&self) {
        let batch = self.inner.read_buffer.drain_all();
        if !batch.is_empty() {
            self.inner.policy.lock().access(&batch);
        }
        self.inner.drain_write_buffer_forced();
    }

    pub fn len(&self) -> u64 {
        self.inner.shards.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        Stats::new(self.inner.shards.total_hits(), self.inner.shards.total_misses())
    }

    /// Stops the maintenance task and marks the cache closed. Further
    /// operations remain callable (`get` and `delete` behave normally;
    /// entries simply stop expiring proactively) but no background work
    /// runs again. Idempotent.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(handle) = self.maintenance.lock().take() {
            handle.stop();
        }
        info!(component = "cache", event = "close");
    }
}

impl<K, V> Drop for Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.inner.state.load(Ordering::Acquire) == OPEN {
            warn!(component = "cache", event = "dropped_without_close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_hits() {
        let cache: Cache<&str, i32> = Cache::new(10);
        cache.set("a", 1);
        let (v, hit) = cache.get(&"a");
        assert_eq!(v, Some(1));
        assert!(hit);
        cache.close();
    }

    #[test]
    fn missing_key_is_a_clean_miss() {
        let cache: Cache<&str, i32> = Cache::new(10);
        let (v, hit) = cache.get(&"nope");
        assert_eq!(v, None);
        assert!(!hit);
        cache.close();
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cache: Cache<&str, i32> = Cache::new(10);
        let err = cache.set_with_ttl("a", 1, Some(Duration::ZERO));
        assert!(matches!(err, Err(CacheError::InvalidTtl)));
        cache.close();
    }

    #[test]
    fn delete_reports_prior_presence() {
        let cache: Cache<&str, i32> = Cache::new(10);
        assert!(!cache.delete(&"a"));
        cache.set("a", 1);
        assert!(cache.delete(&"a"));
        assert_eq!(cache.get(&"a").0, None);
        cache.close();
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache: Cache<&str, i32> = Cache::new(10);
        for i in 0..5 {
            cache.set(Box::leak(i.to_string().into_boxed_str()), i);
        }
        cache.clear();
        assert_eq!(cache.len(), 0);
        cache.close();
    }

    #[test]
    fn capacity_is_enforced_under_sustained_inserts() {
        let cache: Cache<u64, u64> = Cache::<u64, u64>::builder(50).shard_count(16).build();
        for i in 0..5000u64 {
            cache.set(i, i);
            cache.force_drain();
            assert!(cache.len() <= 50);
        }
        cache.close();
    }

    #[test]
    fn capacity_is_enforced_under_concurrent_writers() {
        use std::thread;

        let cache: Arc<Cache<u64, u64>> = Arc::new(Cache::<u64, u64>::builder(50).shard_count(16).build());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = t * 1000 + i;
                        cache.set(key, key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        cache.force_drain();
        assert!(cache.len() <= 50);
        cache.close();
    }

    /// Per this crate's close-semantics: closing only retires the
    /// maintenance sweep. `get`/`set`/`delete` remain fully usable.
    #[test]
    fn operations_after_close_still_work() {
        let cache: Cache<&str, i32> = Cache::new(10);
        cache.close();
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), (Some(1), true));
        assert!(cache.delete(&"a"));
    }

    #[test]
    fn close_is_idempotent() {
        let cache: Cache<&str, i32> = Cache::new(10);
        cache.close();
        cache.close();
    }
}
