//! Bloom filter stored in every SSTable footer section.
//!
//! Bit positions use double hashing over two independent 64-bit hashes
//! (FNV-1a and CRC32 with a distinct seed byte).

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (expected_keys.max(1) * bits_per_key.max(1)).max(64) as u64;
        let words = num_bits.div_ceil(64) as usize;
        // k = bits_per_key * ln 2 minimises the false positive rate.
        let hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
        Self {
            bits: vec![0; words],
            num_bits: words as u64 * 64,
            hashes: hashes.clamp(1, 30),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// `[u32 hashes LE][u64 words LE][words...]`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.bits.len() * 8);
        out.extend_from_slice(&self.hashes.to_le_bytes());
        out.extend_from_slice(&(self.bits.len() as u64).to_le_bytes());
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let hashes = u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
        let words = u64::from_le_bytes(buf.get(4..12)?.try_into().ok()?) as usize;
        let body = buf.get(12..12 + words.checked_mul(8)?)?;
        if words == 0 || hashes == 0 {
            return None;
        }
        let bits = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Some(Self {
            bits,
            num_bits: words as u64 * 64,
            hashes,
        })
    }
}

fn fnv1a(key: &[u8]) -> u64 {
    key.iter().fold(FNV_OFFSET, |h, b| (h ^ *b as u64).wrapping_mul(FNV_PRIME))
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = fnv1a(key);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[0x5a]);
    hasher.update(key);
    let crc = hasher.finalize() as u64;
    // Odd step so positions cover the whole table.
    let h2 = ((crc << 32) | (h1 >> 32)) | 1;
    (h1, h2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_found() {
        let mut bloom = BloomFilter::new(1000, 10);
        for i in 0u32..1000 {
            bloom.insert(&i.to_be_bytes());
        }
        for i in 0u32..1000 {
            assert!(bloom.may_contain(&i.to_be_bytes()), "false negative for {i}");
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let mut bloom = BloomFilter::new(1000, 10);
        for i in 0u32..1000 {
            bloom.insert(&i.to_be_bytes());
        }
        let fp = (1000u32..11_000)
            .filter(|i| bloom.may_contain(&i.to_be_bytes()))
            .count();
        assert!(fp < 500, "false positive rate too high: {fp}/10000");
    }

    #[test]
    fn decode_reads_back_encoded_filter() {
        let mut bloom = BloomFilter::new(10, 10);
        bloom.insert(b"alpha");
        let decoded = BloomFilter::decode(&bloom.encode()).unwrap();
        assert_eq!(decoded, bloom);
        assert!(decoded.may_contain(b"alpha"));
        assert!(BloomFilter::decode(&[1, 2, 3]).is_none());
    }
}
