//! Validation seams for the batch processors.
//!
//! The DNS resolver and HTTP fetcher are external collaborators behind
//! traits; this module supplies the persona-group plumbing around them:
//! config fingerprinting, bounded validator caches, and keyword scanning.

pub mod dns;
pub mod http;
pub mod keywords;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Stable fingerprint of a persona's opaque config payload. Personas with
/// identical configs share one validator (`serde_json` keeps object keys
/// sorted, so equal values serialize equally).
pub fn persona_fingerprint(config: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheSlot<T> {
    value: Arc<T>,
    last_used: AtomicU64,
}

/// Size-capped cache keyed by fingerprint, evicting the least recently used
/// entry on insert beyond capacity. Lookups take the read lock only.
pub struct ValidatorCache<T> {
    capacity: usize,
    tick: AtomicU64,
    slots: RwLock<HashMap<String, CacheSlot<T>>>,
}

impl<T> ValidatorCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_insert_with(&self, key: &str, build: impl FnOnce() -> T) -> Arc<T> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(slots) = self.slots.read()
            && let Some(slot) = slots.get(key)
        {
            slot.last_used.store(tick, Ordering::Relaxed);
            return Arc::clone(&slot.value);
        }
        let mut slots = match self.slots.write() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = slots.get(key) {
            slot.last_used.store(tick, Ordering::Relaxed);
            return Arc::clone(&slot.value);
        }
        let value = Arc::new(build());
        slots.insert(
            key.to_string(),
            CacheSlot {
                value: Arc::clone(&value),
                last_used: AtomicU64::new(tick),
            },
        );
        while slots.len() > self.capacity {
            let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            slots.remove(&oldest);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_configs_share_a_fingerprint() {
        let a = json!({"resolvers": ["192.0.2.53"], "timeout": 5});
        let b = json!({"timeout": 5, "resolvers": ["192.0.2.53"]});
        assert_eq!(persona_fingerprint(&a), persona_fingerprint(&b));
    }

    #[test]
    fn different_configs_differ() {
        let a = json!({"timeout": 5});
        let b = json!({"timeout": 6});
        assert_ne!(persona_fingerprint(&a), persona_fingerprint(&b));
    }

    #[test]
    fn cache_reuses_entries() {
        let cache: ValidatorCache<String> = ValidatorCache::new(4);
        let first = cache.get_or_insert_with("k", || "built".to_string());
        let second = cache.get_or_insert_with("k", || "rebuilt".to_string());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache: ValidatorCache<u32> = ValidatorCache::new(2);
        cache.get_or_insert_with("a", || 1);
        cache.get_or_insert_with("b", || 2);
        // Touch "a" so "b" is the eviction candidate.
        cache.get_or_insert_with("a", || 10);
        cache.get_or_insert_with("c", || 3);
        assert_eq!(cache.len(), 2);
        // "b" must be rebuilt, "a" must not.
        let a = cache.get_or_insert_with("a", || 99);
        assert_eq!(*a, 1);
        let b = cache.get_or_insert_with("b", || 42);
        assert_eq!(*b, 42);
    }
}
