//! Per-block probabilistic membership filter over script data pushes and
//! spent outpoints, used to short-circuit address and outpoint scans.

const LN2: f64 = std::f64::consts::LN_2;
const LN2_SQUARED: f64 = LN2 * LN2;

const MAX_FILTER_SIZE: usize = 36_000;
const MAX_HASH_FUNCS: u32 = 50;

#[derive(Clone, Debug)]
pub struct BlockFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BlockFilter {
    /// Sizes the filter for `elements` expected insertions at the given
    /// false positive rate.
    pub fn new(elements: usize, false_positive_rate: f64, tweak: u32) -> Self {
        let elements = elements.max(1) as f64;
        let size = (-1.0 / LN2_SQUARED * elements * false_positive_rate.ln() / 8.0) as usize;
        let size = size.clamp(1, MAX_FILTER_SIZE);
        let hash_funcs = ((size * 8) as f64 / elements * LN2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);
        Self {
            data: vec![0u8; size],
            hash_funcs,
            tweak,
        }
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n
            .wrapping_mul(0xFBA4_C795)
            .wrapping_add(self.tweak);
        (murmur3_32(seed, data) as usize) % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            if self.data[index >> 3] & (1 << (index & 7)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn serialized_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    /// Rebuilds a filter from its stored fields.
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32) -> Self {
        Self {
            data: if data.is_empty() { vec![0u8] } else { data },
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
        }
    }
}

fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k1 |= (byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_reference_vectors() {
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(0xFBA4_C795, b""), 0x6a39_6f08);
        assert_eq!(murmur3_32(0, b"\x00"), 0x514e_28b7);
    }

    #[test]
    fn inserted_elements_match() {
        let mut filter = BlockFilter::new(100, 1e-6, 0);
        for i in 0u32..100 {
            filter.insert(&i.to_le_bytes());
        }
        for i in 0u32..100 {
            assert!(filter.contains(&i.to_le_bytes()));
        }
    }

    #[test]
    fn absent_elements_rarely_match() {
        let mut filter = BlockFilter::new(100, 1e-10, 7);
        for i in 0u32..100 {
            filter.insert(&i.to_le_bytes());
        }
        let false_positives = (1000u32..2000)
            .filter(|i| filter.contains(&i.to_le_bytes()))
            .count();
        assert_eq!(false_positives, 0);
    }
}
