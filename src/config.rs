//! Builder-style construction for the cache and the memoizer.
//!
//! There is no external config file, env var or CLI surface — construction
//! is entirely in-process. `CacheBuilder` and `MemoizeBuilder` exist purely
//! for named-argument ergonomics over the plain constructors.

use std::hash::Hash;
use std::time::Duration;

use crate::cache::Cache;

/// Builds a [`Cache`] with named options instead of positional arguments.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    pub(crate) capacity: u64,
    pub(crate) nolock: bool,
    pub(crate) shard_count: Option<usize>,
}

impl CacheBuilder {
    pub fn new(capacity: u64) -> Self {
        Self { capacity: capacity.max(1), nolock: false, shard_count: None }
    }

    /// Degrades internal lock contention handling for single-threaded
    /// embeddings: the read buffer stops dropping samples on contention.
    pub fn nolock(mut self, nolock: bool) -> Self {
        self.nolock = nolock;
        self
    }

    /// Overrides the derived shard count. Exists for tests that want
    /// deterministic, small shard counts; production callers should leave
    /// this to the CPU-derived default.
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = Some(count);
        self
    }

    pub fn build<K, V>(self) -> Cache<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        Cache::from_builder(self)
    }
}

/// Configuration accepted by [`crate::singleflight::memoize`] and
/// [`crate::singleflight::memoize_async`].
///
/// `A` is the producer's argument tuple; it drives key derivation via
/// [`crate::singleflight::CacheKey`] unless `key_fn` overrides it.
#[derive(Clone)]
pub struct MemoizeBuilder<A> {
    pub(crate) capacity: u64,
    pub(crate) ttl: Option<Duration>,
    pub(crate) typed: bool,
    pub(crate) nolock: bool,
    pub(crate) key_fn: Option<std::sync::Arc<dyn Fn(&A) -> u64 + Send + Sync>>,
}

impl<A> MemoizeBuilder<A> {
    pub fn new(capacity: u64) -> Self {
        Self { capacity: capacity.max(1), ttl: None, typed: false, nolock: false, key_fn: None }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// When `true`, the argument's *type* participates in key derivation
    /// (so `f(1i64)` and `f(1u8)` are distinct cache entries) instead of
    /// only its value, matching Python's `functools._make_key(typed=True)`.
    pub fn typed(mut self, typed: bool) -> Self {
        self.typed = typed;
        self
    }

    pub fn nolock(mut self, nolock: bool) -> Self {
        self.nolock = nolock;
        self
    }

    /// Supplies a custom key-derivation function, overriding the default
    /// [`crate::singleflight::CacheKey`]-based structural hash.
    pub fn key_fn(mut self, f: impl Fn(&A) -> u64 + Send + Sync + 'static) -> Self {
        self.key_fn = Some(std::sync::Arc::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_builder_defaults_are_sane() {
        let b = CacheBuilder::new(0);
        assert_eq!(b.capacity, 1);
        assert!(!b.nolock);
        assert_eq!(b.shard_count, None);
    }

    #[test]
    fn memoize_builder_chains() {
        let b: MemoizeBuilder<(u64,)> =
            MemoizeBuilder::new(100).ttl(Duration::from_secs(1)).typed(true).nolock(true);
        assert_eq!(b.capacity, 100);
        assert_eq!(b.ttl, Some(Duration::from_secs(1)));
        assert!(b.typed);
        assert!(b.nolock);
    }
}
