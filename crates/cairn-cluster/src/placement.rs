//! Deterministic shard placement for index objects.
//!
//! A container index is spread over `num_shards` companion objects. The
//! shard for a key is chosen by a fixed formula: hash the key, fold the low
//! byte back into the top bits, reduce modulo a fixed prime, then modulo the
//! shard count. The fold and the prime are kept exactly as observed in the
//! original system so that shard assignments stay stable across versions.

use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

/// Fixed prime the folded hash is reduced by before the shard modulus.
const SHARD_PRIME: u32 = 7877;

/// Hash key for cross-node placement consistency.
const PLACEMENT_HASH_KEY: (u64, u64) = (0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908);

/// Deterministic string hash used for shard selection.
///
/// Uses keyed SipHash-1-3 so every node computes the same value.
#[inline]
#[must_use]
pub fn placement_hash(key: &str) -> u32 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    key.hash(&mut hasher);
    hasher.finish() as u32
}

/// Returns the index shard for `key`, in `[0, num_shards)`.
///
/// A shard count of zero means the index is unsharded; everything maps to
/// shard 0.
#[inline]
#[must_use]
pub fn shard_for_key(key: &str, num_shards: u32) -> u32 {
    if num_shards <= 1 {
        return 0;
    }
    let sid = placement_hash(key);
    let folded = sid ^ ((sid & 0xFF) << 24);
    (folded % SHARD_PRIME) % num_shards
}
