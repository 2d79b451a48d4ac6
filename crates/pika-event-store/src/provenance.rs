//! Which relays delivered which message.
//!
//! Two trackers share one contract. [`ExactProvenance`] keeps every
//! (id, url) pair. [`BloomProvenance`] keeps one fixed-size Bloom filter per
//! relay, so memory grows with the number of relays and not with the number of
//! messages; queries may over-report a relay but never miss one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use nostr::EventId;
use sha2::{Digest, Sha256};

use crate::storage::{FilterStore, RelayRecordStore};

pub trait RelayProvenance: Send + Sync {
    /// Record that `url` delivered `id`. Returns true if the pair was not known before.
    fn record(&mut self, id: &EventId, url: &str) -> bool;
    /// Relays that delivered `id`.
    fn query(&self, id: &EventId) -> BTreeSet<String>;
}

pub struct ExactProvenance {
    records: HashMap<EventId, BTreeSet<String>>,
    store: Arc<dyn RelayRecordStore>,
}

impl ExactProvenance {
    pub fn load(store: Arc<dyn RelayRecordStore>) -> Self {
        let mut records: HashMap<EventId, BTreeSet<String>> = HashMap::new();
        match store.get_all_relay_records() {
            Ok(rows) => {
                for (id, url) in rows {
                    records.entry(id).or_default().insert(url);
                }
            }
            Err(e) => tracing::warn!(%e, "failed to load relay records; starting empty"),
        }
        Self { records, store }
    }
}

impl RelayProvenance for ExactProvenance {
    fn record(&mut self, id: &EventId, url: &str) -> bool {
        let is_new = self.records.entry(*id).or_default().insert(url.to_string());
        if is_new {
            if let Err(e) = self.store.set_relay_record(id, url) {
                tracing::warn!(%e, %id, relay = url, "failed to persist relay record");
            }
        }
        is_new
    }

    fn query(&self, id: &EventId) -> BTreeSet<String> {
        self.records.get(id).cloned().unwrap_or_default()
    }
}

const FILTER_MAGIC: &[u8; 4] = b"PKBF";
const FILTER_HEADER_LEN: usize = 4 + 4 + 8;

/// Fixed-size Bloom filter using double hashing over SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        let num_hashes = num_hashes.max(1);
        Self {
            bits: vec![0; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        }
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(item);
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(a);
        // An odd step keeps the probe sequence from collapsing onto one bit.
        let h2 = u64::from_le_bytes(b) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    /// Insert `item`; returns true if at least one bit changed.
    pub fn insert(&mut self, item: &[u8]) -> bool {
        let positions: Vec<u64> = self.positions(item).collect();
        let mut changed = false;
        for pos in positions {
            let (byte, mask) = ((pos / 8) as usize, 1u8 << (pos % 8));
            if self.bits[byte] & mask == 0 {
                self.bits[byte] |= mask;
                changed = true;
            }
        }
        changed
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item).all(|pos| {
            let (byte, mask) = ((pos / 8) as usize, 1u8 << (pos % 8));
            self.bits[byte] & mask != 0
        })
    }

    /// `PKBF | num_hashes (u32 LE) | num_bits (u64 LE) | bit bytes`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILTER_HEADER_LEN + self.bits.len());
        out.extend_from_slice(FILTER_MAGIC);
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FILTER_HEADER_LEN || &bytes[0..4] != FILTER_MAGIC {
            return None;
        }
        let num_hashes = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let num_bits = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let body = &bytes[FILTER_HEADER_LEN..];
        if num_hashes == 0 || num_bits == 0 || body.len() as u64 != num_bits.div_ceil(8) {
            return None;
        }
        Some(Self {
            bits: body.to_vec(),
            num_bits,
            num_hashes,
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }
}

pub struct BloomProvenance {
    filters: BTreeMap<String, BloomFilter>,
    num_bits: u64,
    num_hashes: u32,
    store: Arc<dyn FilterStore>,
}

impl BloomProvenance {
    /// Rebuild from persisted filters. Corrupt or mis-sized entries are dropped
    /// and that relay starts over with an empty filter.
    pub fn load(store: Arc<dyn FilterStore>, num_bits: u64, num_hashes: u32) -> Self {
        let mut filters = BTreeMap::new();
        match store.load_filters() {
            Ok(rows) => {
                for (url, bytes) in rows {
                    match BloomFilter::from_bytes(&bytes) {
                        Some(f) => {
                            filters.insert(url, f);
                        }
                        None => tracing::warn!(relay = %url, "discarding corrupt relay filter"),
                    }
                }
            }
            Err(e) => tracing::warn!(%e, "failed to load relay filters; starting empty"),
        }
        Self {
            filters,
            num_bits,
            num_hashes,
            store,
        }
    }
}

impl RelayProvenance for BloomProvenance {
    fn record(&mut self, id: &EventId, url: &str) -> bool {
        let (num_bits, num_hashes) = (self.num_bits, self.num_hashes);
        let filter = self
            .filters
            .entry(url.to_string())
            .or_insert_with(|| BloomFilter::new(num_bits, num_hashes));
        // A false positive here reads as "already known", so at worst one
        // provenance notification is skipped.
        let is_new = filter.insert(id.as_bytes());
        if is_new {
            if let Err(e) = self.store.save_filter(url, &filter.to_bytes()) {
                tracing::warn!(%e, relay = url, "failed to persist relay filter");
            }
        }
        is_new
    }

    fn query(&self, id: &EventId) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter(|(_, f)| f.contains(id.as_bytes()))
            .map(|(url, _)| url.clone())
            .collect()
    }
}
