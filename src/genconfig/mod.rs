//! Generation-offset configuration manager.
//!
//! Campaigns sharing a generator configuration (same fingerprint) share one
//! `domain_generation_config_states` row. This manager is the sole writer of
//! those rows and protects the monotonically-advancing offset with
//! versioned compare-and-swap updates, a bounded read-through cache, and a
//! per-fingerprint read/write lock for scoped coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{ConfigStateError, StoreError};
use crate::models::ConfigState;
use crate::store::{CampaignStore, json_field, ts_field, ts_text};

/// How many fingerprints the read-through cache retains.
const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct AtomicUpdateRequest {
    pub config_hash: String,
    /// `0` means "no row expected yet" (first registration).
    pub expected_version: i64,
    pub new_last_offset: i64,
    pub config_details: Value,
}

#[derive(Debug, Clone, Default)]
pub struct AtomicUpdateOutcome {
    pub success: bool,
    pub new_version: Option<i64>,
    pub conflict_version: Option<i64>,
    pub current_offset: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateOp {
    Read,
    Update,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigCacheMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
}

#[derive(Debug, Clone)]
pub struct ConsistencyCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

struct CacheEntry {
    state: ConfigState,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

pub struct ConfigStateManager {
    store: Arc<CampaignStore>,
    cache: Mutex<CacheInner>,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConfigStateManager {
    pub fn new(store: Arc<CampaignStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<CampaignStore>, capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(CacheInner::default()),
            locks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached read. Returns a copy; the cache never hands out references.
    pub fn get(&self, config_hash: &str) -> Result<Option<ConfigState>, ConfigStateError> {
        if let Ok(mut cache) = self.cache.lock() {
            cache.tick += 1;
            let tick = cache.tick;
            if let Some(entry) = cache.entries.get_mut(config_hash) {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.state.clone()));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let conn = self.store.lock()?;
        let state = get_row(&conn, config_hash)?;
        drop(conn);
        if let Some(ref state) = state {
            self.cache_put(state.clone());
        }
        Ok(state)
    }

    /// Single read-modify-write attempt with optimistic locking. The mutator
    /// receives the current state (or an unregistered version-0 state) and
    /// returns the desired next state; a mutator error aborts the attempt.
    pub fn update(
        &self,
        config_hash: &str,
        mutator: &mut dyn FnMut(&ConfigState) -> Result<ConfigState, ConfigStateError>,
    ) -> Result<ConfigState, ConfigStateError> {
        let base = self
            .get(config_hash)?
            .unwrap_or_else(|| ConfigState::unregistered(config_hash));
        let next = mutator(&base)?;
        let outcome = self.atomic_update(&AtomicUpdateRequest {
            config_hash: config_hash.to_string(),
            expected_version: base.version,
            new_last_offset: next.last_offset,
            config_details: next.config_details.clone(),
        })?;
        if outcome.success {
            return self
                .get(config_hash)?
                .ok_or_else(|| {
                    StoreError::ConfigStateNotFound {
                        config_hash: config_hash.to_string(),
                    }
                    .into()
                });
        }
        if let Some(current) = outcome.conflict_version {
            self.invalidate_cache(config_hash);
            return Err(ConfigStateError::VersionConflict {
                config_hash: config_hash.to_string(),
                expected: base.version,
                current,
            });
        }
        Err(ConfigStateError::OffsetRegression {
            config_hash: config_hash.to_string(),
            attempted: next.last_offset,
            current: outcome.current_offset.unwrap_or(0),
        })
    }

    /// `update` retried on version conflicts. Offset regressions and
    /// persistence errors are not retried.
    pub fn update_with_retry(
        &self,
        config_hash: &str,
        mutator: &mut dyn FnMut(&ConfigState) -> Result<ConfigState, ConfigStateError>,
        max_attempts: u32,
    ) -> Result<ConfigState, ConfigStateError> {
        for attempt in 1..=max_attempts {
            match self.update(config_hash, mutator) {
                Err(ConfigStateError::VersionConflict { current, .. }) => {
                    debug!(
                        config_hash,
                        attempt, current_version = current, "version conflict, retrying"
                    );
                }
                other => return other,
            }
        }
        Err(ConfigStateError::RetriesExhausted {
            config_hash: config_hash.to_string(),
            attempts: max_attempts,
        })
    }

    /// The compare-and-swap primitive in its own transaction. Business
    /// failures (conflict, regression) land in the outcome; only
    /// persistence problems become errors.
    pub fn atomic_update(
        &self,
        request: &AtomicUpdateRequest,
    ) -> Result<AtomicUpdateOutcome, ConfigStateError> {
        let outcome = self
            .store
            .with_tx(|tx| Self::atomic_update_on(tx, request))?;
        if outcome.success {
            self.invalidate_cache(&request.config_hash);
        } else {
            warn!(
                config_hash = %request.config_hash,
                error = outcome.error_message.as_deref().unwrap_or("unknown"),
                "atomic config update rejected"
            );
        }
        Ok(outcome)
    }

    /// Uncached read on a caller-supplied connection, for callers composing
    /// a transaction around [`Self::atomic_update_on`].
    pub fn read_on(
        conn: &Connection,
        config_hash: &str,
    ) -> Result<Option<ConfigState>, StoreError> {
        get_row(conn, config_hash)
    }

    /// Same branch logic on a caller-supplied connection, so batch
    /// processors can fold the offset advance into their own transaction.
    pub fn atomic_update_on(
        conn: &Connection,
        request: &AtomicUpdateRequest,
    ) -> Result<AtomicUpdateOutcome, StoreError> {
        let current = get_row(conn, &request.config_hash)?;
        let Some(current) = current else {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO domain_generation_config_states
                     (config_hash, last_offset, config_details, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                params![
                    request.config_hash,
                    request.new_last_offset,
                    request.config_details.to_string(),
                    ts_text(now),
                ],
            )?;
            return Ok(AtomicUpdateOutcome {
                success: true,
                new_version: Some(1),
                ..Default::default()
            });
        };

        // `expected_version == 0` declares insert intent; a row appearing in
        // the meantime is a lost race, reported as a conflict so the caller
        // re-reads and retries against the real version.
        if request.expected_version != current.version {
            return Ok(AtomicUpdateOutcome {
                conflict_version: Some(current.version),
                current_offset: Some(current.last_offset),
                error_message: Some("Version conflict".to_string()),
                ..Default::default()
            });
        }
        if request.new_last_offset < current.last_offset {
            return Ok(AtomicUpdateOutcome {
                current_offset: Some(current.last_offset),
                error_message: Some(format!(
                    "Offset regression: {} is behind {}",
                    request.new_last_offset, current.last_offset
                )),
                ..Default::default()
            });
        }

        let new_version = current.version + 1;
        conn.execute(
            "UPDATE domain_generation_config_states
             SET last_offset = ?1, config_details = ?2, version = ?3, updated_at = ?4
             WHERE config_hash = ?5",
            params![
                request.new_last_offset,
                request.config_details.to_string(),
                new_version,
                ts_text(Utc::now()),
                request.config_hash,
            ],
        )?;
        Ok(AtomicUpdateOutcome {
            success: true,
            new_version: Some(new_version),
            current_offset: Some(request.new_last_offset),
            ..Default::default()
        })
    }

    /// Run `body` while holding the per-fingerprint lock for the given
    /// operation kind. The lock is scoped to the body.
    pub async fn coordinate<F, Fut, T>(
        &self,
        config_hash: &str,
        op: CoordinateOp,
        actor: &str,
        body: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.hash_lock(config_hash);
        debug!(config_hash, actor, ?op, "coordinating config access");
        match op {
            CoordinateOp::Read => {
                let _guard = lock.read().await;
                body().await
            }
            CoordinateOp::Update => {
                let _guard = lock.write().await;
                body().await
            }
        }
    }

    pub fn validate_consistency(
        &self,
        config_hash: &str,
    ) -> Result<Vec<ConsistencyCheck>, ConfigStateError> {
        let conn = self.store.lock()?;
        let stored = get_row(&conn, config_hash)?;
        drop(conn);

        let mut checks = Vec::new();
        match stored {
            None => {
                checks.push(ConsistencyCheck {
                    name: "row_exists",
                    passed: false,
                    detail: format!("no config state row for {config_hash}"),
                });
            }
            Some(state) => {
                checks.push(ConsistencyCheck {
                    name: "row_exists",
                    passed: true,
                    detail: String::new(),
                });
                checks.push(ConsistencyCheck {
                    name: "version_positive",
                    passed: state.version >= 1,
                    detail: format!("version = {}", state.version),
                });
                checks.push(ConsistencyCheck {
                    name: "offset_non_negative",
                    passed: state.last_offset >= 0,
                    detail: format!("last_offset = {}", state.last_offset),
                });
                let cached = self
                    .cache
                    .lock()
                    .ok()
                    .and_then(|c| c.entries.get(config_hash).map(|e| e.state.clone()));
                if let Some(cached) = cached {
                    checks.push(ConsistencyCheck {
                        name: "cache_agrees_with_store",
                        passed: cached.version == state.version
                            && cached.last_offset == state.last_offset,
                        detail: format!(
                            "cache v{} offset {}, store v{} offset {}",
                            cached.version, cached.last_offset, state.version, state.last_offset
                        ),
                    });
                }
            }
        }
        Ok(checks)
    }

    pub fn invalidate_cache(&self, config_hash: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.entries.remove(config_hash);
        }
    }

    pub fn metrics(&self) -> ConfigCacheMetrics {
        let size = self.cache.lock().map(|c| c.entries.len()).unwrap_or(0);
        ConfigCacheMetrics {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_size: size,
        }
    }

    fn cache_put(&self, state: ConfigState) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        cache.tick += 1;
        let tick = cache.tick;
        cache.entries.insert(
            state.config_hash.clone(),
            CacheEntry {
                state,
                last_used: tick,
            },
        );
        while cache.entries.len() > self.capacity {
            let Some(oldest) = cache
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            cache.entries.remove(&oldest);
        }
    }

    fn hash_lock(&self, config_hash: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(config_hash.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

fn get_row(conn: &Connection, config_hash: &str) -> Result<Option<ConfigState>, StoreError> {
    let state = conn
        .query_row(
            "SELECT config_hash, last_offset, config_details, version, created_at, updated_at
             FROM domain_generation_config_states WHERE config_hash = ?1",
            params![config_hash],
            |row| {
                Ok(ConfigState {
                    config_hash: row.get(0)?,
                    last_offset: row.get(1)?,
                    config_details: json_field(row, 2)?,
                    version: row.get(3)?,
                    created_at: ts_field(row, 4)?,
                    updated_at: ts_field(row, 5)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> ConfigStateManager {
        let store = Arc::new(CampaignStore::open_in_memory().unwrap());
        ConfigStateManager::new(store)
    }

    fn request(hash: &str, expected: i64, offset: i64) -> AtomicUpdateRequest {
        AtomicUpdateRequest {
            config_hash: hash.to_string(),
            expected_version: expected,
            new_last_offset: offset,
            config_details: json!({"tld": "com"}),
        }
    }

    #[test]
    fn first_update_inserts_at_version_one() {
        let mgr = manager();
        let outcome = mgr.atomic_update(&request("h1", 0, 10)).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new_version, Some(1));
        let state = mgr.get("h1").unwrap().unwrap();
        assert_eq!(state.last_offset, 10);
        assert_eq!(state.version, 1);
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 10)).unwrap();
        mgr.atomic_update(&request("h1", 1, 20)).unwrap();
        let outcome = mgr.atomic_update(&request("h1", 1, 30)).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflict_version, Some(2));
        assert!(outcome.error_message.unwrap().contains("conflict"));
    }

    #[test]
    fn offset_regression_is_rejected() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 50)).unwrap();
        let outcome = mgr.atomic_update(&request("h1", 1, 40)).unwrap();
        assert!(!outcome.success);
        assert!(outcome.conflict_version.is_none());
        assert_eq!(outcome.current_offset, Some(50));
        // The row is untouched.
        let state = mgr.get("h1").unwrap().unwrap();
        assert_eq!(state.last_offset, 50);
        assert_eq!(state.version, 1);
    }

    #[test]
    fn equal_offset_update_succeeds_and_bumps_version() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 10)).unwrap();
        let outcome = mgr.atomic_update(&request("h1", 1, 10)).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new_version, Some(2));
    }

    #[test]
    fn update_surfaces_typed_regression_error() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 50)).unwrap();
        let result = mgr.update("h1", &mut |state| {
            let mut next = state.clone();
            next.last_offset = 10;
            Ok(next)
        });
        assert!(matches!(
            result,
            Err(ConfigStateError::OffsetRegression {
                attempted: 10,
                current: 50,
                ..
            })
        ));
    }

    #[test]
    fn cache_hits_and_misses_are_tracked() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 5)).unwrap();
        // atomic_update invalidated the entry; first get is a miss.
        mgr.get("h1").unwrap();
        mgr.get("h1").unwrap();
        mgr.get("h1").unwrap();
        let metrics = mgr.metrics();
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.cache_size, 1);
    }

    #[test]
    fn cache_evicts_least_recently_used_beyond_capacity() {
        let store = Arc::new(CampaignStore::open_in_memory().unwrap());
        let mgr = ConfigStateManager::with_capacity(store, 2);
        for (hash, offset) in [("a", 1), ("b", 2), ("c", 3)] {
            mgr.atomic_update(&request(hash, 0, offset)).unwrap();
            mgr.get(hash).unwrap();
        }
        assert_eq!(mgr.metrics().cache_size, 2);
        // "a" was the least recently used and must have been evicted, so
        // reading it again is a miss.
        let misses_before = mgr.metrics().cache_misses;
        mgr.get("a").unwrap();
        assert_eq!(mgr.metrics().cache_misses, misses_before + 1);
    }

    #[test]
    fn validate_consistency_reports_missing_row() {
        let mgr = manager();
        let checks = mgr.validate_consistency("absent").unwrap();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].passed);
    }

    #[test]
    fn validate_consistency_passes_for_registered_hash() {
        let mgr = manager();
        mgr.atomic_update(&request("h1", 0, 10)).unwrap();
        mgr.get("h1").unwrap();
        let checks = mgr.validate_consistency("h1").unwrap();
        assert!(checks.iter().all(|c| c.passed), "{checks:?}");
    }

    #[tokio::test]
    async fn coordinate_serializes_writers() {
        let mgr = Arc::new(manager());
        let counter = Arc::new(Mutex::new(0_i32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                mgr.coordinate("h1", CoordinateOp::Update, "test", || async move {
                    let mut guard = counter.lock().unwrap();
                    *guard += 1;
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[tokio::test]
    async fn concurrent_incremental_updates_lose_no_writes() {
        // Two writers, each advancing the shared offset by 10, fifty times.
        let mgr = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::task::spawn_blocking(move || {
                for _ in 0..50 {
                    mgr.update_with_retry(
                        "shared",
                        &mut |state| {
                            let mut next = state.clone();
                            next.last_offset = state.last_offset + 10;
                            Ok(next)
                        },
                        100,
                    )
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let state = mgr.get("shared").unwrap().unwrap();
        assert_eq!(state.last_offset, 1000);
        assert_eq!(state.version, 100);
    }
}
