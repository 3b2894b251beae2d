/*
 * Diarization Server - Rust Edition
 * Copyright (c) 2024 Diarization Server Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::DiarizationResult;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry cap; inserting past it evicts the oldest entry first.
    pub max_entries: usize,
    /// Entries older than this are never returned.
    pub ttl: Duration,
    /// Coarse interval for the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

struct CacheEntry {
    data: DiarizationResult,
    inserted_at: Instant,
}

/// Content-addressed result cache.
///
/// Keyed by a fingerprint of the uploaded bytes so an identical re-upload
/// within the TTL window never reaches the pipeline. Eviction is by age of
/// insertion, not by last read; the cache is tuned for "retry within
/// minutes", not for a hot set.
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: CacheConfig,
}

static GLOBAL: OnceLock<Arc<ResultCache>> = OnceLock::new();

/// Process-wide cache. The configuration is captured on first call; later
/// calls return the existing instance and ignore their argument.
pub fn global(config: CacheConfig) -> Arc<ResultCache> {
    GLOBAL.get_or_init(|| ResultCache::new(config)).clone()
}

/// First 16 hex characters of the SHA-256 over the raw input bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}

impl ResultCache {
    /// Must be called from within a tokio runtime; the sweep task is spawned
    /// here and stops once the cache is dropped.
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            config,
        });
        spawn_sweeper(Arc::downgrade(&cache));
        cache
    }

    /// Stored result for these bytes, unless missing or expired. Expired
    /// entries encountered here are deleted on the spot.
    pub fn get(&self, bytes: &[u8]) -> Option<DiarizationResult> {
        let key = fingerprint(bytes);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.config.ttl => {
                tracing::debug!("cache hit for {}", key);
                Some(entry.data.clone())
            }
            Some(_) => {
                tracing::debug!("cache entry {} expired, dropping", key);
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite. At capacity, the entry with the oldest insertion
    /// time is evicted first.
    pub fn set(&self, bytes: &[u8], data: DiarizationResult) {
        let key = fingerprint(bytes);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!("cache at capacity, evicting {}", oldest);
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                data,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn sweep(&self) {
        let ttl = self.config.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::debug!("cache sweep dropped {} expired entries", dropped);
        }
    }
}

fn spawn_sweeper(cache: Weak<ResultCache>) {
    tokio::spawn(async move {
        let interval = match cache.upgrade() {
            Some(cache) => cache.config.sweep_interval,
            None => return,
        };
        loop {
            tokio::time::sleep(interval).await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            cache.sweep();
        }
    });
}
