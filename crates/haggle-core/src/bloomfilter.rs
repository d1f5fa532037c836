//! Bloom filters (spec §3 "Bloom filter")
//!
//! Two flavors share a bit/counter array shape `(m, k, salts)`: a plain
//! filter that only ORs bits in (used for the wire-exchanged interest
//! summaries) and a counting filter that can remove an element again (used
//! locally to track forwarded objects). A counting filter projects onto a
//! plain one by treating every bin `> 0` as set.
//!
//! Parameter selection (`m`, `k` from an error rate and a capacity) follows
//! the classical optimization: for each candidate `k` compute the `m` that
//! hits the target false-positive rate for `capacity` insertions, keep the
//! smallest `m`, then round up to a whole number of bytes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_NUM_HASH_FUNCS: u32 = 32;
const WIRE_MAGIC_PLAIN: u8 = 0;
const WIRE_MAGIC_COUNTING: u8 = 1;

/// `(error_rate, capacity)` -> `(m, k)` used when a caller doesn't already
/// know the bit array size they want.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BloomfilterParams {
    pub error_rate: f64,
    pub capacity: u32,
}

impl Default for BloomfilterParams {
    fn default() -> Self {
        // Matches the defaults baked into utils/bloomfilter.c.
        Self {
            error_rate: 0.01,
            capacity: 1000,
        }
    }
}

impl BloomfilterParams {
    /// Compute `(m, k)` bits/hash-count for this error rate and capacity.
    ///
    /// Mirrors `bloomfilter_calculate_length`: for every candidate `k` from 1
    /// to `MAX_NUM_HASH_FUNCS`, derive the `m` that achieves `error_rate` at
    /// `capacity` insertions, and keep the smallest `m` seen. `m` is rounded
    /// up to a multiple of 8 so the bit array packs into whole bytes.
    pub fn optimize(&self) -> (u32, u32) {
        let n = self.capacity.max(1) as f64;
        let mut best_m = u32::MAX;
        let mut best_k = 1u32;
        for k in 1..=MAX_NUM_HASH_FUNCS {
            let denom = (1.0 - self.error_rate.powf(1.0 / k as f64)).ln();
            if denom == 0.0 || !denom.is_finite() {
                continue;
            }
            let m = (-(k as f64) * n / denom).ceil();
            if !m.is_finite() || m <= 0.0 {
                continue;
            }
            let m = m as u64;
            let m_rounded = ((m + 7) / 8 * 8) as u32;
            if m_rounded < best_m {
                best_m = m_rounded;
                best_k = k;
            }
        }
        if best_m == u32::MAX {
            // Degenerate error rate; fall back to a single hash over a byte.
            best_m = 8;
            best_k = 1;
        }
        (best_m, best_k)
    }
}

fn bit_hashes(data: &[u8], k: u32, m: u32, salts: &[u64]) -> Vec<u32> {
    (0..k)
        .map(|i| {
            let salt = salts.get(i as usize).copied().unwrap_or(i as u64);
            let mut hasher = blake3::Hasher::new();
            hasher.update(&salt.to_le_bytes());
            hasher.update(data);
            let digest = hasher.finalize();
            let bytes = digest.as_bytes();
            let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            v % m.max(1)
        })
        .collect()
}

/// A plain, insert-only Bloom filter: bits only ever go from 0 to 1, and two
/// filters of the same shape merge by OR-ing their bit arrays.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bloomfilter {
    m: u32,
    k: u32,
    salts: Vec<u64>,
    bits: Vec<u8>,
    /// Number of objects inserted since creation (not reconstructible from
    /// `bits` alone once collisions have happened).
    num_objects: u32,
}

impl Bloomfilter {
    /// Build an empty filter sized for `params`.
    pub fn new(params: BloomfilterParams, salts: Vec<u64>) -> Result<Self> {
        let (m, k) = params.optimize();
        Self::with_shape(m, k, salts)
    }

    /// Build an empty filter with an explicit shape, e.g. to match a peer's
    /// filter before merging.
    pub fn with_shape(m: u32, k: u32, salts: Vec<u64>) -> Result<Self> {
        if m == 0 || m % 8 != 0 || k == 0 || salts.len() != k as usize {
            return Err(Error::BloomMalformed { len: (m / 8) as usize });
        }
        Ok(Self {
            m,
            k,
            salts,
            bits: vec![0u8; (m / 8) as usize],
            num_objects: 0,
        })
    }

    pub fn m(&self) -> u32 {
        self.m
    }
    pub fn k(&self) -> u32 {
        self.k
    }
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    fn same_shape(&self, other: &Bloomfilter) -> bool {
        self.m == other.m && self.k == other.k && self.salts == other.salts
    }

    pub fn add(&mut self, data: &[u8]) {
        for bit in bit_hashes(data, self.k, self.m, &self.salts) {
            let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
            self.bits[byte as usize] |= mask;
        }
        self.num_objects += 1;
    }

    pub fn has(&self, data: &[u8]) -> bool {
        bit_hashes(data, self.k, self.m, &self.salts)
            .into_iter()
            .all(|bit| {
                let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
                self.bits[byte as usize] & mask != 0
            })
    }

    /// OR another filter of the same shape into this one.
    pub fn merge(&mut self, other: &Bloomfilter) -> Result<()> {
        if !self.same_shape(other) {
            return Err(Error::BloomShapeMismatch {
                m_self: self.m,
                k_self: self.k,
                m_other: other.m,
                k_other: other.k,
            });
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
        self.num_objects = self.num_objects.saturating_add(other.num_objects);
        Ok(())
    }

    /// Wire form: big-endian `k`, `m`, `n` header followed by the raw bit
    /// array, base64-encoded. Matches `bloomfilter_to_base64`'s envelope.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        let mut buf = Vec::with_capacity(1 + 4 + 4 + 4 + self.salts.len() * 8 + self.bits.len());
        buf.push(WIRE_MAGIC_PLAIN);
        buf.extend_from_slice(&self.k.to_be_bytes());
        buf.extend_from_slice(&self.m.to_be_bytes());
        buf.extend_from_slice(&self.num_objects.to_be_bytes());
        for salt in &self.salts {
            buf.extend_from_slice(&salt.to_be_bytes());
        }
        buf.extend_from_slice(&self.bits);
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.decode(s)?;
        Self::from_raw(&raw)
    }

    fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() < 13 || raw[0] != WIRE_MAGIC_PLAIN {
            return Err(Error::BloomMalformed { len: raw.len() });
        }
        let k = u32::from_be_bytes(raw[1..5].try_into().unwrap());
        let m = u32::from_be_bytes(raw[5..9].try_into().unwrap());
        let num_objects = u32::from_be_bytes(raw[9..13].try_into().unwrap());
        let salts_len = k as usize * 8;
        let expected = 13 + salts_len + (m / 8) as usize;
        if m == 0 || m % 8 != 0 || k == 0 || raw.len() != expected {
            return Err(Error::BloomMalformed { len: raw.len() });
        }
        let mut salts = Vec::with_capacity(k as usize);
        for i in 0..k as usize {
            let off = 13 + i * 8;
            salts.push(u64::from_be_bytes(raw[off..off + 8].try_into().unwrap()));
        }
        let bits = raw[13 + salts_len..].to_vec();
        Ok(Self {
            m,
            k,
            salts,
            bits,
            num_objects,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.bits
    }
}

/// A counting Bloom filter: each bin holds a small saturating counter so an
/// element can be removed again without disturbing others that hashed to the
/// same bin. Used locally (e.g. `forwardedObjects` bookkeeping) and never
/// sent over the wire in this form.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountingBloomfilter {
    m: u32,
    k: u32,
    salts: Vec<u64>,
    bins: Vec<u8>,
    num_objects: u32,
}

impl CountingBloomfilter {
    pub fn new(params: BloomfilterParams, salts: Vec<u64>) -> Result<Self> {
        let (m, k) = params.optimize();
        if m == 0 || k == 0 || salts.len() != k as usize {
            return Err(Error::BloomMalformed { len: 0 });
        }
        Ok(Self {
            m,
            k,
            salts,
            bins: vec![0u8; m as usize],
            num_objects: 0,
        })
    }

    pub fn add(&mut self, data: &[u8]) {
        for bin in bit_hashes(data, self.k, self.m, &self.salts) {
            let c = &mut self.bins[bin as usize];
            *c = c.saturating_add(1);
        }
        self.num_objects += 1;
    }

    /// Remove one occurrence of `data`. A no-op past zero on any bin (the
    /// element was never fully present, or this call is a duplicate).
    pub fn remove(&mut self, data: &[u8]) {
        for bin in bit_hashes(data, self.k, self.m, &self.salts) {
            let c = &mut self.bins[bin as usize];
            *c = c.saturating_sub(1);
        }
        self.num_objects = self.num_objects.saturating_sub(1);
    }

    pub fn has(&self, data: &[u8]) -> bool {
        bit_hashes(data, self.k, self.m, &self.salts)
            .into_iter()
            .all(|bin| self.bins[bin as usize] > 0)
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Project to a plain filter: every bin `> 0` becomes a set bit.
    pub fn to_noncounting(&self) -> Bloomfilter {
        let mut bits = vec![0u8; (self.m as usize + 7) / 8];
        for (i, &c) in self.bins.iter().enumerate() {
            if c > 0 {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        let m = bits.len() as u32 * 8;
        Bloomfilter {
            m,
            k: self.k,
            salts: self.salts.clone(),
            bits,
            num_objects: self.num_objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salts(k: u32) -> Vec<u64> {
        (0..k as u64).collect()
    }

    #[test]
    fn optimize_produces_multiple_of_eight() {
        let params = BloomfilterParams {
            error_rate: 0.01,
            capacity: 1000,
        };
        let (m, k) = params.optimize();
        assert_eq!(m % 8, 0);
        assert!(k >= 1);
    }

    #[test]
    fn no_false_negatives() {
        let params = BloomfilterParams {
            error_rate: 0.01,
            capacity: 100,
        };
        let (m, k) = params.optimize();
        let mut bf = Bloomfilter::with_shape(m, k, salts(k)).unwrap();
        let items: Vec<Vec<u8>> = (0..50u32).map(|i| i.to_le_bytes().to_vec()).collect();
        for item in &items {
            bf.add(item);
        }
        for item in &items {
            assert!(bf.has(item), "false negative for {item:?}");
        }
    }

    #[test]
    fn merge_rejects_shape_mismatch() {
        let a = Bloomfilter::with_shape(64, 3, salts(3)).unwrap();
        let b = Bloomfilter::with_shape(128, 3, salts(3)).unwrap();
        let mut a = a;
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn merge_is_union() {
        let mut a = Bloomfilter::with_shape(256, 3, salts(3)).unwrap();
        let mut b = Bloomfilter::with_shape(256, 3, salts(3)).unwrap();
        a.add(b"one");
        b.add(b"two");
        a.merge(&b).unwrap();
        assert!(a.has(b"one"));
        assert!(a.has(b"two"));
    }

    #[test]
    fn base64_round_trip() {
        let mut bf = Bloomfilter::with_shape(64, 2, salts(2)).unwrap();
        bf.add(b"hello");
        let encoded = bf.to_base64();
        let decoded = Bloomfilter::from_base64(&encoded).unwrap();
        assert_eq!(bf, decoded);
        assert!(decoded.has(b"hello"));
    }

    #[test]
    fn counting_remove_then_absent() {
        let mut cbf = CountingBloomfilter::new(
            BloomfilterParams {
                error_rate: 0.01,
                capacity: 10,
            },
            salts(7),
        )
        .unwrap();
        cbf.add(b"x");
        assert!(cbf.has(b"x"));
        cbf.remove(b"x");
        // Removing a singly-inserted element clears every bin it touched,
        // barring a hash collision with something else that's still present.
        assert!(!cbf.has(b"x"));
    }

    #[test]
    fn counting_projects_to_plain() {
        let mut cbf = CountingBloomfilter::new(
            BloomfilterParams {
                error_rate: 0.01,
                capacity: 10,
            },
            salts(5),
        )
        .unwrap();
        cbf.add(b"x");
        let plain = cbf.to_noncounting();
        assert!(plain.has(b"x"));
    }
}
