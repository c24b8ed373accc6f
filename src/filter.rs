//! Bloom filter block (spec.md §4.1).
//!
//! Standard LevelDB-family double-hashing Bloom filter: a 32-bit hash `h`
//! is split into a base hash and a delta (`h`'s upper bits, rotated), and
//! probe `i` uses `h + i*delta`. Sized as `bf_bits_per_key * key_count`
//! bits with `k = round(bits_per_key * ln2)` hash functions, per spec.md.

use bytes::BufMut;

/// Builds a single Bloom filter over all keys in one table.
#[derive(Debug)]
pub struct FilterBuilder {
    bits_per_key: usize,
    keys: Vec<Vec<u8>>,
}

impl FilterBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key,
            keys: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn is_enabled(&self) -> bool {
        self.bits_per_key > 0
    }

    /// Finalizes the filter into its persisted byte form: the bit array
    /// followed by a trailing byte recording `k`, the number of hash
    /// functions used (so a reader built with different options can still
    /// probe filters written by an older one).
    pub fn finish(&mut self) -> Vec<u8> {
        if self.bits_per_key == 0 || self.keys.is_empty() {
            return Vec::new();
        }

        let k = num_hash_functions(self.bits_per_key);
        let mut num_bits = self.keys.len() * self.bits_per_key;
        num_bits = num_bits.max(64);
        let num_bytes = (num_bits + 7) / 8;
        num_bits = num_bytes * 8;

        let mut bits = vec![0u8; num_bytes];
        for key in &self.keys {
            let h = bloom_hash(key);
            let delta = h.rotate_left(15);
            let mut h = h;
            for _ in 0..k {
                let bit_pos = (h as usize) % num_bits;
                bits[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }

        let mut out = Vec::with_capacity(bits.len() + 1);
        out.put_slice(&bits);
        out.put_u8(k as u8);
        self.keys.clear();
        out
    }
}

/// Computes `k = round(bits_per_key * ln2)`, clamped to `[1, 30]` the way
/// the LevelDB family does to avoid degenerate filters at extreme
/// `bits_per_key` settings.
fn num_hash_functions(bits_per_key: usize) -> usize {
    let k = (bits_per_key as f64 * std::f64::consts::LN_2).round() as i64;
    k.clamp(1, 30) as usize
}

/// The same hash the LevelDB family derives its filter hashes from
/// (Bob Jenkins' `mix`-style hash, seed `0xbc9f1d34`).
fn bloom_hash(data: &[u8]) -> u32 {
    const SEED: u32 = 0xbc9f_1d34;
    const M: u32 = 0xc6a4_a793;

    let mut h: u32 = SEED ^ (data.len() as u32).wrapping_mul(M);
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes(chunk.try_into().unwrap());
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut buf = [0u8; 4];
        buf[..remainder.len()].copy_from_slice(remainder);
        let w = u32::from_le_bytes(buf);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    h
}

/// Tests whether `key` may be present in a filter produced by
/// [`FilterBuilder::finish`]. A `false` result is a guarantee of absence;
/// `true` may be a false positive.
pub fn may_contain(filter: &[u8], key: &[u8]) -> bool {
    if filter.len() < 2 {
        return false;
    }
    let k = filter[filter.len() - 1] as u32;
    let bits = &filter[..filter.len() - 1];
    let num_bits = bits.len() * 8;
    if num_bits == 0 {
        return false;
    }

    let h = bloom_hash(key);
    let delta = h.rotate_left(15);
    let mut h = h;
    for _ in 0..k {
        let bit_pos = (h as usize) % num_bits;
        if bits[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_rejects_everything() {
        let mut builder = FilterBuilder::new(8);
        let filter = builder.finish();
        assert!(filter.is_empty());
        assert!(!may_contain(&filter, b"anything"));
    }

    #[test]
    fn zero_bits_per_key_disables_filter() {
        let builder = FilterBuilder::new(0);
        assert!(!builder.is_enabled());
    }

    #[test]
    fn no_false_negatives() {
        let mut builder = FilterBuilder::new(10);
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            builder.add(key.as_bytes());
        }
        let filter = builder.finish();
        for key in &keys {
            assert!(
                may_contain(&filter, key.as_bytes()),
                "false negative for {key}"
            );
        }
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let mut builder = FilterBuilder::new(10);
        let present: Vec<String> = (0..2000).map(|i| format!("present-{i}")).collect();
        for key in &present {
            builder.add(key.as_bytes());
        }
        let filter = builder.finish();

        let absent: Vec<String> = (0..2000).map(|i| format!("absent-{i}")).collect();
        let false_positives = absent
            .iter()
            .filter(|k| may_contain(&filter, k.as_bytes()))
            .count();
        // bits_per_key=10 should give well under 5% false positives.
        assert!(
            false_positives < 100,
            "too many false positives: {false_positives}/2000"
        );
    }

    #[test]
    fn num_hash_functions_matches_formula() {
        assert_eq!(num_hash_functions(8), 6);
        assert_eq!(num_hash_functions(10), 7);
    }
}
