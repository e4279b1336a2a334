//! Request fingerprinting and the bounded response cache.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::event::Event;

pub type Fingerprint = [u8; 32];

/// SHA-256 over the exact request body bytes. Used only as a cache key.
pub fn fingerprint(body: &[u8]) -> Fingerprint {
    Sha256::digest(body).into()
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub events: Vec<Event>,
}

struct CacheEntry {
    response: std::sync::Arc<CachedResponse>,
    last_used: AtomicU64,
}

/// Bounded LRU of successful compile responses keyed by request
/// fingerprint. Recency is tracked with a per-entry tick from a shared
/// counter; inserting into a full cache evicts the smallest tick.
pub struct ResponseCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    capacity: usize,
    tick: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<std::sync::Arc<CachedResponse>> {
        let entry = self.entries.get(key)?;
        entry.last_used.store(self.next_tick(), Ordering::Relaxed);
        Some(entry.response.clone())
    }

    pub fn insert(&self, key: Fingerprint, response: CachedResponse) {
        let tick = self.next_tick();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                response: std::sync::Arc::new(response),
                last_used: AtomicU64::new(tick),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn evict_oldest(&self) {
        let mut oldest: Option<(Fingerprint, u64)> = None;
        for entry in self.entries.iter() {
            let used = entry.value().last_used.load(Ordering::Relaxed);
            if oldest.map_or(true, |(_, min)| used < min) {
                oldest = Some((*entry.key(), used));
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
        }
    }
}
