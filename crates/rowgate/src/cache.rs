//! Read Cache with TTL Expiry and LRU Eviction
//!
//! Tenant-namespaced read-through cache consulted before any remote read.
//!
//! ## Keys
//!
//! Every key carries `tenant:kind:sheet:params_hash`, so no two tenants or
//! resource kinds can collide and no operation can address another tenant's
//! entries. `params_hash` is a SHA-256 prefix over the canonical filter
//! encoding — two requests with the same filter share one entry.
//!
//! ## Expiry and Eviction
//!
//! - **Lazy TTL**: an entry whose `expires_at` has passed is treated as a
//!   miss and removed on access, even if the sweep has not run yet.
//! - **Active sweep**: a background task removes expired entries periodically
//!   to bound memory between accesses.
//! - **LRU bound**: insertion enforces a maximum entry count and an optional
//!   estimated-byte budget; the least-recently-used entry goes first,
//!   independent of its TTL.
//!
//! TTLs are per resource kind (`CacheConfig::ttl_for`), not a single global
//! value — configuration reads stay cached longer than row reads.
//!
//! All operations are synchronous and non-yielding: state sits behind one
//! `std::sync::Mutex` and nothing inside awaits.

use crate::config::{CacheConfig, MissingSizePolicy};
use lru::LruCache;
use rowgate_core::{ResourceKind, RowFilter};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Namespaced cache key: `tenant:kind:sheet:params_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub kind: ResourceKind,
    pub sheet: String,
    pub params_hash: String,
}

impl CacheKey {
    /// Key for a row read (full sheet or filtered view).
    pub fn rows(tenant_id: &str, sheet: &str, filter: Option<&RowFilter>) -> Self {
        let params = filter.map(|f| f.canonical()).unwrap_or_else(|| "all".to_string());
        Self {
            tenant_id: tenant_id.to_string(),
            kind: ResourceKind::Rows,
            sheet: sheet.to_string(),
            params_hash: hash_params(&params),
        }
    }

    /// Key for sheet existence/header metadata.
    pub fn sheet_meta(tenant_id: &str, sheet: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            kind: ResourceKind::SheetMeta,
            sheet: sheet.to_string(),
            params_hash: hash_params("meta"),
        }
    }

    /// Whether this key is derived from the given tenant's sheet.
    pub fn derived_from(&self, tenant_id: &str, sheet: &str) -> bool {
        self.tenant_id == tenant_id && self.sheet == sheet
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.tenant_id,
            self.kind.as_str(),
            self.sheet,
            self.params_hash
        )
    }
}

/// First 16 hex chars of SHA-256 over the canonical parameter encoding.
fn hash_params(params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    size_estimate: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache counters, read without locking the store.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

/// Point-in-time view of the counters plus current entry count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

struct Store {
    entries: LruCache<CacheKey, CacheEntry>,
    current_bytes: usize,
}

/// TTL/LRU read cache.
pub struct ReadCache {
    config: CacheConfig,
    store: Mutex<Store>,
    stats: Arc<CacheStats>,
}

impl ReadCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap();
        Self {
            config,
            store: Mutex::new(Store {
                entries: LruCache::new(capacity),
                current_bytes: 0,
            }),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Look up a key. Expired entries are removed and counted as misses.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let mut store = self.store.lock().unwrap();

        let expired = match store.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                let value = entry.value.clone();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "cache hit");
                return Some(value);
            }
            None => false,
        };

        if expired {
            if let Some(entry) = store.entries.pop(key) {
                store.current_bytes = store.current_bytes.saturating_sub(entry.size_estimate);
            }
            trace!(key = %key, "cache entry expired");
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert with the TTL policy for the key's resource kind and a size
    /// estimate computed from the serialized value.
    pub fn insert(&self, key: CacheKey, value: Value) {
        let size = value.to_string().len();
        self.insert_with_size(key, value, Some(size));
    }

    /// Insert with an explicit (possibly unknown) size estimate.
    ///
    /// Unknown sizes follow `MissingSizePolicy`: fail-open admits the entry
    /// with a zero byte estimate, fail-closed skips caching the value.
    pub fn insert_with_size(&self, key: CacheKey, value: Value, size: Option<usize>) {
        let size = match (size, self.config.missing_size_policy) {
            (Some(size), _) => size,
            (None, MissingSizePolicy::FailOpen) => 0,
            (None, MissingSizePolicy::FailClosed) => {
                debug!(key = %key, "size unknown, skipping cache insert");
                return;
            }
        };

        let ttl = self.config.ttl_for(key.kind);
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
            size_estimate: size,
        };

        let mut store = self.store.lock().unwrap();

        // Byte budget: evict LRU entries until the new entry fits.
        if let Some(max_bytes) = self.config.max_bytes {
            while store.current_bytes + size > max_bytes {
                match store.entries.pop_lru() {
                    Some((victim, old)) => {
                        store.current_bytes =
                            store.current_bytes.saturating_sub(old.size_estimate);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                        trace!(key = %victim, "evicted for byte budget");
                    }
                    None => break, // entry larger than the whole budget
                }
            }
        }

        // Entry-count bound: LruCache::push evicts the LRU entry itself.
        // Push also returns the old entry when the key is re-inserted; a
        // same-key refresh is not an eviction.
        if let Some((victim, old)) = store.entries.push(key.clone(), entry) {
            store.current_bytes = store.current_bytes.saturating_sub(old.size_estimate);
            if victim == key {
                trace!(key = %key, "replaced existing entry");
            } else {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %victim, "evicted for entry bound");
            }
        }
        store.current_bytes += size;
    }

    /// Remove one entry.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut store = self.store.lock().unwrap();
        if let Some(entry) = store.entries.pop(key) {
            store.current_bytes = store.current_bytes.saturating_sub(entry.size_estimate);
            debug!(key = %key, "invalidated");
        }
    }

    /// Remove every entry derived from one tenant's sheet (all kinds, all
    /// filtered views).
    pub fn invalidate_sheet(&self, tenant_id: &str, sheet: &str) -> usize {
        let mut store = self.store.lock().unwrap();
        let victims: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(k, _)| k.derived_from(tenant_id, sheet))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &victims {
            if let Some(entry) = store.entries.pop(key) {
                store.current_bytes = store.current_bytes.saturating_sub(entry.size_estimate);
            }
        }
        if !victims.is_empty() {
            debug!(
                tenant = tenant_id,
                sheet = sheet,
                count = victims.len(),
                "invalidated sheet entries"
            );
        }
        victims.len()
    }

    /// Proactively remove expired entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.lock().unwrap();
        let expired: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = store.entries.pop(key) {
                store.current_bytes = store.current_bytes.saturating_sub(entry.size_estimate);
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheSnapshot {
        let size = self.store.lock().unwrap().entries.len();
        CacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size,
        }
    }

    /// Estimated bytes currently held.
    pub fn current_bytes(&self) -> usize {
        self.store.lock().unwrap().current_bytes
    }

    /// Drop everything (shutdown and tests).
    pub fn clear(&self) {
        let mut store = self.store.lock().unwrap();
        store.entries.clear();
        store.current_bytes = 0;
    }

    /// Spawn the periodic sweep task. Returns its handle so shutdown can
    /// abort it.
    pub fn start_background_sweep(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = interval.as_millis(), "starting cache sweep task");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(max_entries: usize, rows_ttl_ms: u64) -> CacheConfig {
        CacheConfig {
            max_entries,
            rows_ttl_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_namespacing_separates_tenants_and_kinds() {
        let a = CacheKey::rows("t1", "CONFIG", None);
        let b = CacheKey::rows("t2", "CONFIG", None);
        let c = CacheKey::sheet_meta("t1", "CONFIG");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, CacheKey::rows("t1", "CONFIG", None));
    }

    #[test]
    fn test_filter_hash_distinguishes_views() {
        let all = CacheKey::rows("t1", "USERS", None);
        let filtered = CacheKey::rows(
            "t1",
            "USERS",
            Some(&RowFilter::new("status", json!("active"))),
        );
        assert_ne!(all, filtered);
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = ReadCache::new(config(10, 60_000));
        let key = CacheKey::rows("t1", "CONFIG", None);

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), json!(["row"]));
        assert_eq!(cache.get(&key), Some(json!(["row"])));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let cache = ReadCache::new(config(10, 10)); // 10ms TTL
        let key = CacheKey::rows("t1", "CONFIG", None);
        cache.insert(key.clone(), json!("v"));

        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().size, 0); // removed on access
    }

    #[test]
    fn test_lru_eviction_at_entry_bound() {
        let cache = ReadCache::new(config(2, 60_000));
        let a = CacheKey::rows("t1", "A", None);
        let b = CacheKey::rows("t1", "B", None);
        let c = CacheKey::rows("t1", "C", None);

        cache.insert(a.clone(), json!("a"));
        cache.insert(b.clone(), json!("b"));
        cache.get(&a); // a is now most recently used
        cache.insert(c.clone(), json!("c")); // evicts b

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.stats().size <= 2);
    }

    #[test]
    fn test_same_key_refresh_is_not_an_eviction() {
        let cache = ReadCache::new(config(10, 60_000));
        let key = CacheKey::rows("t1", "CONFIG", None);

        cache.insert_with_size(key.clone(), json!("v1"), Some(10));
        cache.insert_with_size(key.clone(), json!("v2"), Some(25));

        assert_eq!(cache.get(&key), Some(json!("v2")));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.size, 1);
        // Only the new entry's estimate is accounted
        assert_eq!(cache.current_bytes(), 25);
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache = ReadCache::new(CacheConfig {
            max_entries: 100,
            max_bytes: Some(40),
            rows_ttl_ms: 60_000,
            ..Default::default()
        });

        let a = CacheKey::rows("t1", "A", None);
        let b = CacheKey::rows("t1", "B", None);
        cache.insert_with_size(a.clone(), json!("a"), Some(30));
        cache.insert_with_size(b.clone(), json!("b"), Some(30));

        // a was evicted to fit b under the 40-byte budget
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        assert!(cache.current_bytes() <= 40);
    }

    #[test]
    fn test_missing_size_fail_open_vs_fail_closed() {
        let open = ReadCache::new(CacheConfig {
            max_bytes: Some(100),
            missing_size_policy: MissingSizePolicy::FailOpen,
            ..Default::default()
        });
        let key = CacheKey::rows("t1", "A", None);
        open.insert_with_size(key.clone(), json!("v"), None);
        assert!(open.get(&key).is_some());

        let closed = ReadCache::new(CacheConfig {
            max_bytes: Some(100),
            missing_size_policy: MissingSizePolicy::FailClosed,
            ..Default::default()
        });
        closed.insert_with_size(key.clone(), json!("v"), None);
        assert!(closed.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_sheet_removes_all_derived_views() {
        let cache = ReadCache::new(config(10, 60_000));
        let all = CacheKey::rows("t1", "USERS", None);
        let filtered = CacheKey::rows(
            "t1",
            "USERS",
            Some(&RowFilter::new("status", json!("active"))),
        );
        let meta = CacheKey::sheet_meta("t1", "USERS");
        let other_tenant = CacheKey::rows("t2", "USERS", None);
        let other_sheet = CacheKey::rows("t1", "ORDERS", None);

        for key in [&all, &filtered, &meta, &other_tenant, &other_sheet] {
            cache.insert(key.clone(), json!("v"));
        }

        assert_eq!(cache.invalidate_sheet("t1", "USERS"), 3);
        assert!(cache.get(&all).is_none());
        assert!(cache.get(&filtered).is_none());
        assert!(cache.get(&meta).is_none());
        // Other tenants and sheets untouched
        assert!(cache.get(&other_tenant).is_some());
        assert!(cache.get(&other_sheet).is_some());
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let cache = ReadCache::new(CacheConfig {
            rows_ttl_ms: 5,
            sheet_ttl_ms: 60_000,
            ..Default::default()
        });
        cache.insert(CacheKey::rows("t1", "A", None), json!("short"));
        cache.insert(CacheKey::sheet_meta("t1", "A"), json!("long"));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_clear() {
        let cache = ReadCache::new(config(10, 60_000));
        cache.insert(CacheKey::rows("t1", "A", None), json!("v"));
        cache.clear();
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.current_bytes(), 0);
    }
}
