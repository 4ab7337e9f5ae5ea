//! Key hashing and the fingerprint spreader.
//!
//! A fingerprint is a 64-bit integer derived from the user key's hash by
//! running it through [`spread`]. The policy, read buffer, write buffer and
//! timer wheel all identify entries by fingerprint alone.

use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::Xxh3;

/// Returns the smallest power-of-two `>= x`.
pub fn next_pow2(x: usize) -> usize {
    if x <= 1 {
        return 1;
    }
    let mut x = x - 1;
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        x |= x >> 32;
    }
    x + 1
}

/// Hashes a user key into a 64-bit integer via xxh3.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = Xxh3::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Mixes a 64-bit value using the SplitMix64 round function (public-domain;
/// Steele et al.). Used to derive pseudo-independent indices from one seed.
pub fn mix64(x: u64) -> u64 {
    const INC: u64 = 0x9E3779B97F4A7C15;
    const MUL1: u64 = 0xBF58476D1CE4E5B9;
    const MUL2: u64 = 0x94D049BB133111EB;

    let mut x = x.wrapping_add(INC);
    x = (x ^ (x >> 30)).wrapping_mul(MUL1);
    x = (x ^ (x >> 27)).wrapping_mul(MUL2);
    x ^ (x >> 31)
}

/// Spreads a hash to defend against low-entropy user hash functions.
///
/// Two xor-shift-multiply rounds, applied to the raw key hash before it is
/// ever used as a fingerprint, shard index, or sketch coordinate.
pub fn spread(h: u64) -> u64 {
    let mut h = h;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Derives the fingerprint for a user key: hash then spread.
pub fn fingerprint<K: Hash + ?Sized>(key: &K) -> u64 {
    spread(hash_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pow2_rounds_up() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(2), 2);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(1000), 1024);
    }

    #[test]
    fn spread_is_deterministic_and_diffusing() {
        assert_eq!(spread(42), spread(42));
        // low-entropy inputs should not collide once spread
        let a = spread(1);
        let b = spread(2);
        assert_ne!(a, b);
        // spreading should change most bits even for adjacent inputs
        assert!((a ^ b).count_ones() > 10);
    }

    #[test]
    fn fingerprint_is_stable_for_same_key() {
        assert_eq!(fingerprint("hello"), fingerprint("hello"));
        assert_ne!(fingerprint("hello"), fingerprint("world"));
    }
}
