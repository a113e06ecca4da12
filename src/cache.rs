//! Response cache for query answers.
//!
//! Entries are keyed by `(document, normalized query, parameters,
//! generation)`. Because the generation is part of the key, an answer can
//! never be served for a generation other than the one that produced it;
//! entries for superseded generations are purged eagerly when a newer
//! generation is cached or built.
//!
//! Eviction follows an access counter: when the cache is full the least
//! recently used tenth of the entries is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rag_lifecycle_core::models::{Answer, CacheMetrics, DocumentId, QueryParams};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;

struct CacheEntry {
    document_id: DocumentId,
    generation: u64,
    answer: Answer,
    inserted: Instant,
    last_access: AtomicU64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

pub struct RAGCacheService {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: AtomicU64,
    counters: Counters,
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for one query against one generation.
pub fn cache_key(
    document_id: DocumentId,
    query: &str,
    params: &QueryParams,
    generation: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.to_le_bytes());
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0]);
    hasher.update(params.canonical().as_bytes());
    hasher.update(generation.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

impl RAGCacheService {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a cached answer. Misses when disabled, absent, or expired.
    pub fn get(
        &self,
        document_id: DocumentId,
        query: &str,
        params: &QueryParams,
        generation: u64,
    ) -> Option<Answer> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(document_id, query, params, generation);

        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some(entry) if entry.inserted.elapsed() < self.ttl => {
                    entry.last_access.store(self.tick(), Ordering::Relaxed);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.answer.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries
                .get(&key)
                .is_some_and(|e| e.inserted.elapsed() >= self.ttl)
            {
                entries.remove(&key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an answer produced by `generation`. Older generations of the
    /// same document are dropped.
    pub fn put(
        &self,
        document_id: DocumentId,
        query: &str,
        params: &QueryParams,
        generation: u64,
        answer: Answer,
    ) {
        if !self.enabled {
            return;
        }
        let key = cache_key(document_id, query, params, generation);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let before = entries.len();
        entries.retain(|_, e| !(e.document_id == document_id && e.generation < generation));
        self.add_invalidations(before - entries.len());

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            self.evict_lru(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                document_id,
                generation,
                answer,
                inserted: Instant::now(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
    }

    fn evict_lru(&self, entries: &mut HashMap<String, CacheEntry>) {
        let evict_count = (self.max_entries / 10).max(1);
        let mut by_access: Vec<(String, u64)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access.load(Ordering::Relaxed)))
            .collect();
        by_access.sort_by_key(|(_, access)| *access);
        let mut evicted = 0u64;
        for (key, _) in by_access.into_iter().take(evict_count) {
            if entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, "evicted least recently used answers");
    }

    fn add_invalidations(&self, n: usize) {
        if n > 0 {
            self.counters
                .invalidations
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Drop entries for `document_id` whose generation is not `current`.
    pub fn purge_stale(&self, document_id: DocumentId, current: u64) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.document_id != document_id || e.generation == current);
        let removed = before - entries.len();
        self.add_invalidations(removed);
        if removed > 0 {
            debug!(document_id, generation = current, removed, "purged stale answers");
        }
        removed
    }

    /// Remove every entry, or only those of one document.
    pub fn clear(&self, document_id: Option<DocumentId>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        match document_id {
            Some(id) => entries.retain(|_, e| e.document_id != id),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        self.add_invalidations(removed);
        removed
    }

    pub fn stats(&self) -> CacheMetrics {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner()).len();
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries,
        }
    }
}
