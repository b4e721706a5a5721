//! Fixed-size bloom filter over subscriber sequence numbers

/// Bits allocated per expected element (~1% false positives with 7 probes)
const BITS_PER_ELEMENT: usize = 10;
const PROBES: u64 = 7;

#[derive(Debug, Clone)]
pub struct Bloom {
    words: Vec<u64>,
    bits: u64,
    capacity: usize,
    len: usize,
}

impl Bloom {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(64);
        let bits = (capacity * BITS_PER_ELEMENT).next_power_of_two();

        Self {
            words: vec![0; bits / 64],
            bits: bits as u64,
            capacity,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: u64) {
        let (h1, h2) = hashes(value);
        for i in 0..PROBES {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) & (self.bits - 1);
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.len += 1;
    }

    /// `false` is definitive, `true` may be a false positive
    pub fn contains(&self, value: u64) -> bool {
        let (h1, h2) = hashes(value);
        (0..PROBES).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) & (self.bits - 1);
            self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// More insertions than sized for; the false positive rate is degrading
    pub fn is_overloaded(&self) -> bool {
        self.len > self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size_in_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }
}

fn hashes(value: u64) -> (u64, u64) {
    let h1 = splitmix64(value);
    let h2 = splitmix64(h1) | 1;
    (h1, h2)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
