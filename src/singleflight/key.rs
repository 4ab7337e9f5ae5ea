//! Key derivation for the single-flight memoizer.

use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::Xxh3;

/// Derives the internal cache key for a producer's argument value.
///
/// Blanket-implemented for anything `Hash`; `typed` additionally mixes the
/// argument's type name into the hash, so e.g. `f(1i64)` and `f(1u8)`
/// produce distinct keys when typed derivation is requested — matching
/// Python's `functools._make_key(..., typed=True)`.
pub trait CacheKey {
    fn cache_key(&self, typed: bool) -> u64;
}

impl<T: Hash + ?Sized> CacheKey for T {
    fn cache_key(&self, typed: bool) -> u64 {
        let mut hasher = Xxh3::new();
        self.hash(&mut hasher);
        if typed {
            std::any::type_name::<T>().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_same_key() {
        assert_eq!(42i64.cache_key(false), 42i64.cache_key(false));
    }

    #[test]
    fn typed_flag_distinguishes_same_value_different_type() {
        let untyped_a = 1i64.cache_key(false);
        let untyped_b = 1u8.cache_key(false);
        let typed_a = 1i64.cache_key(true);
        let typed_b = 1u8.cache_key(true);
        assert_ne!(typed_a, typed_b);
        // Without typing, equal-valued hashes of distinct primitive types
        // may or may not collide depending on Hash impls; typed mode must
        // never collide for distinct types.
        let _ = (untyped_a, untyped_b);
    }
}
