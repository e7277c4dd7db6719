//! Key hashing and comparison capabilities.
//!
//! The map does not hash or compare keys itself. Both concerns are injected
//! through a capability value, so that a caller with domain knowledge (e.g.
//! pre-hashed identifiers) can swap the whole scheme out. The capability is
//! meant to be a zero-sized type: the map is generic over it, so every lookup
//! monomorphizes down to direct calls with nothing to dispatch at runtime.

use seahash::SeaHasher;
use std::hash::{Hash, Hasher};

/// Strip the sign bit off a hash.
///
/// Every hash entering the map is masked down to its low 31 bits, so routing
/// arithmetic only ever sees non-negative values.
pub fn mask(hash: i32) -> usize {
    (hash & 0x7FFF_FFFF) as usize
}

/// A hash/equality capability over keys.
pub trait KeyOps<K> {
    /// Hash a key into 32 bits.
    ///
    /// The result is sign-masked by the map before any routing is derived
    /// from it, so implementations may return negative values freely. The
    /// function must be deterministic and should distribute well; chain
    /// lengths and the segment balance depend directly on it.
    fn hash(&self, key: &K) -> i32;

    /// Are the two keys equal?
    ///
    /// Keys which are equal must hash identically.
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// The default capability: SeaHash over `Hash`, equality over `Eq`.
#[derive(Clone, Copy, Default)]
pub struct Sea;

impl<K: Hash + Eq> KeyOps<K> for Sea {
    fn hash(&self, key: &K) -> i32 {
        let mut hasher = SeaHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as i32
    }

    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_clears_the_sign() {
        assert_eq!(mask(0), 0);
        assert_eq!(mask(1), 1);
        assert_eq!(mask(-1), 0x7FFF_FFFF);
        assert_eq!(mask(::std::i32::MIN), 0);
    }

    #[test]
    fn sea_is_deterministic() {
        assert_eq!(Sea.hash(&42u64), Sea.hash(&42u64));
        assert!(Sea.eq(&42u64, &42u64));
        assert!(!Sea.eq(&42u64, &43u64));
    }

    #[test]
    fn sea_spreads_small_keys() {
        // A couple of consecutive keys should not all collide.
        let mut hashes = Vec::new();
        for key in 0u64..64 {
            hashes.push(mask(Sea.hash(&key)));
        }
        hashes.sort();
        hashes.dedup();
        assert!(hashes.len() > 32);
    }
}
