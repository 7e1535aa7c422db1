//! In-memory translation cache with TTL.
//! Key: `text:src_lang:tgt_lang`. Expiry is lazy: an entry is removed the
//! first time a `get` finds it stale. A background sweep and a size cap are
//! available but off unless configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;

/// Separator between key fields. Keys stay unambiguous as long as the two
/// language fields never contain it; the text field may.
pub const KEY_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(text: &str, src_lang: &str, tgt_lang: &str) -> Self {
        let mut key = String::with_capacity(text.len() + src_lang.len() + tgt_lang.len() + 2);
        key.push_str(text);
        key.push(KEY_SEPARATOR);
        key.push_str(src_lang);
        key.push(KEY_SEPARATOR);
        key.push_str(tgt_lang);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: String,
    created_at: Instant,
}

pub struct ResultCache {
    inner: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    max_entries: Option<usize>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
            max_entries: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl: config.ttl,
            max_entries: config.max_entries.filter(|n| *n > 0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a cached translation. Returns None if absent or expired;
    /// an expired entry is deleted on the way out.
    pub fn get(&self, text: &str, src_lang: &str, tgt_lang: &str) -> Option<String> {
        let key = CacheKey::new(text, src_lang, tgt_lang);
        {
            let cache = self.inner.read();
            match cache.get(&key) {
                None => return None,
                Some(entry) if entry.created_at.elapsed() < self.ttl => {
                    return Some(entry.result.clone());
                }
                Some(_) => {}
            }
        }

        // Expired. Re-check under the write lock: a concurrent set may have
        // replaced the entry between the two locks.
        let mut cache = self.inner.write();
        let stale = cache
            .get(&key)
            .map(|entry| entry.created_at.elapsed() >= self.ttl)
            .unwrap_or(false);
        if stale {
            cache.remove(&key);
            debug!(key_len = key.as_str().len(), "expired cache entry removed");
            return None;
        }
        cache.get(&key).map(|entry| entry.result.clone())
    }

    /// Insert or overwrite a translation, stamped now.
    pub fn set(&self, text: &str, src_lang: &str, tgt_lang: &str, result: impl Into<String>) {
        let key = CacheKey::new(text, src_lang, tgt_lang);
        let entry = CacheEntry {
            result: result.into(),
            created_at: Instant::now(),
        };
        let mut cache = self.inner.write();
        if let Some(cap) = self.max_entries {
            if !cache.contains_key(&key) && cache.len() >= cap {
                evict_oldest(&mut cache);
            }
        }
        cache.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.created_at.elapsed() < ttl);
        before - cache.len()
    }

    /// Start a background sweep that purges expired entries every `interval`
    /// until `token` is cancelled.
    pub fn start_sweep_loop(
        cache: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            info!(removed, "cache sweep");
                        }
                    }
                }
            }
            debug!("cache sweep loop stopped");
        })
    }
}

fn evict_oldest(cache: &mut HashMap<CacheKey, CacheEntry>) {
    let oldest = cache
        .iter()
        .min_by_key(|(_, entry)| entry.created_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        cache.remove(&key);
        debug!("cache full, evicted oldest entry");
    }
}
