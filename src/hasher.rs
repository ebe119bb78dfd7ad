use xxhash_rust::xxh3::xxh3_64;

/// Hashes an opaque byte sequence to 64 bits.
///
/// This is the single hash used across the engine: the key directory keys
/// entries by it, the value cache uses it as the owner id, and the key-part
/// index hashes substrings with it. Any fast non-cryptographic 64-bit hash
/// works here; xxh3 is used for its throughput on short inputs.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// The 32-bit prefix stored in hash-table slots as a pre-filter.
///
/// Zero is reserved as the empty-slot marker, so the prefix is nudged to 1
/// when the truncation lands on it.
#[inline]
pub fn hash_prefix(hash: u64) -> u32 {
    let h = hash as u32;
    if h == 0 {
        1
    } else {
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_bytes(b"some key");
        let b = hash_bytes(b"some key");
        assert_eq!(a, b);
        assert_ne!(a, hash_bytes(b"some other key"));
    }

    #[test]
    fn test_prefix_never_zero() {
        // Brute-force a few inputs; the invariant matters, not the spread.
        for i in 0u32..10_000 {
            assert_ne!(hash_prefix(hash_bytes(&i.to_le_bytes())), 0);
        }
        assert_eq!(hash_prefix(0), 1);
    }
}
