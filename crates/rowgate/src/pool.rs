//! Connection Pool
//!
//! Maintains at most one live handle to the remote document store per tenant,
//! so concurrent requests for the same tenant share a session instead of each
//! paying the connection cost.
//!
//! ## Handle Lifecycle
//!
//! ```text
//! acquire(tenant)
//!   ├── healthy handle in pool → bump last-used, return it   (fast path)
//!   └── missing / broken / idle-expired
//!         └── connect with bounded retries → insert → return
//!
//! mark_broken(tenant) → handle flagged, dropped on next acquire
//! ```
//!
//! Opening a handle retries with backoff up to `PoolConfig::connect_attempts`
//! total attempts, each bounded by `connect_timeout_ms`; exhaustion surfaces
//! `Error::ConnectionFailed` without retrying further up the stack. A handle
//! flagged broken (an auth failure mid-call) is never handed out again — the
//! next acquire reconnects.
//!
//! Connects are serialized per tenant, never pool-wide: the handle map is
//! locked only for lookups and inserts, so one tenant's slow open cannot
//! stall another tenant's acquire.
//!
//! The pool is bounded: inserting past `max_handles` evicts the
//! least-recently-used tenant's handle first.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::registry::TenantRegistry;
use crate::remote::{DocumentClient, RemoteError, RowStore};
use crate::retry::{retry_with_backoff, RetryPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

struct PooledHandle {
    client: Arc<dyn DocumentClient>,
    opened_at: Instant,
    last_used: std::sync::Mutex<Instant>,
    broken: AtomicBool,
}

impl PooledHandle {
    fn new(client: Arc<dyn DocumentClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            opened_at: now,
            last_used: std::sync::Mutex::new(now),
            broken: AtomicBool::new(false),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }
}

/// Pool counters, read without locking the handle map.
#[derive(Debug, Default)]
struct PoolCounters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub open_handles: usize,
    pub connects: u64,
    pub connect_failures: u64,
    pub reuses: u64,
    pub evictions: u64,
}

/// Per-tenant handle pool over the remote store.
pub struct ConnectionPool {
    store: Arc<dyn RowStore>,
    registry: Arc<TenantRegistry>,
    config: PoolConfig,
    handles: RwLock<HashMap<String, Arc<PooledHandle>>>,
    /// Serializes connects per tenant so concurrent acquires for the same
    /// tenant open one handle, without blocking other tenants.
    connect_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(store: Arc<dyn RowStore>, registry: Arc<TenantRegistry>, config: PoolConfig) -> Self {
        Self {
            store,
            registry,
            config,
            handles: RwLock::new(HashMap::new()),
            connect_locks: std::sync::Mutex::new(HashMap::new()),
            counters: PoolCounters::default(),
        }
    }

    /// Get the tenant's document handle, reusing a healthy pooled one or
    /// opening a new connection with bounded retries.
    pub async fn acquire(&self, tenant_id: &str) -> Result<Arc<dyn DocumentClient>> {
        // Fast path: healthy handle already pooled.
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(tenant_id) {
                if !handle.is_broken() && handle.idle_for() < self.config.max_idle() {
                    handle.touch();
                    self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                    return Ok(handle.client.clone());
                }
            }
        }

        let config = self.registry.resolve_enabled(tenant_id).await?;

        // Serialize the connect per tenant. The handle map stays unlocked
        // while the remote open runs, so other tenants' acquires proceed.
        let connect_lock = {
            let mut locks = self.connect_locks.lock().unwrap();
            locks
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _connecting = connect_lock.lock().await;

        // Another task may have connected while we waited for the lock.
        {
            let mut handles = self.handles.write().await;
            if let Some(handle) = handles.get(tenant_id) {
                if !handle.is_broken() && handle.idle_for() < self.config.max_idle() {
                    handle.touch();
                    self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                    return Ok(handle.client.clone());
                }
                handles.remove(tenant_id);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(tenant = tenant_id, "dropped stale handle before reconnect");
            }
        }

        let policy = RetryPolicy::new(
            self.config.connect_attempts,
            Duration::from_millis(self.config.connect_backoff_ms),
            Duration::from_millis(self.config.connect_backoff_ms * 8),
            2.0,
        );
        let connect_timeout = self.config.connect_timeout();
        let store = &self.store;
        let connected = retry_with_backoff(&policy, || {
            let fut = store.load_document(&config.document_id, &config.credentials_ref);
            async move {
                match tokio::time::timeout(connect_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(format!(
                        "connect exceeded {}ms",
                        connect_timeout.as_millis()
                    ))),
                }
            }
        })
        .await;

        let client = match connected {
            Ok(client) => client,
            Err(err) => {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(tenant = tenant_id, error = %err, "connect attempts exhausted");
                return Err(Error::ConnectionFailed(format!(
                    "tenant {tenant_id}: {err}"
                )));
            }
        };
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        info!(tenant = tenant_id, document = %config.document_id, "opened document handle");

        let mut handles = self.handles.write().await;

        // Bounded pool: make room by evicting the least-recently-used handle.
        while handles.len() >= self.config.max_handles {
            let victim = handles
                .iter()
                .min_by_key(|(_, h)| *h.last_used.lock().unwrap())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    handles.remove(&id);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(tenant = %id, "evicted LRU handle at pool capacity");
                }
                None => break,
            }
        }

        handles.insert(tenant_id.to_string(), Arc::new(PooledHandle::new(client.clone())));
        Ok(client)
    }

    /// Flag the tenant's pooled handle as unusable. The next acquire for the
    /// tenant reconnects instead of reusing it.
    pub async fn mark_broken(&self, tenant_id: &str) {
        let handles = self.handles.read().await;
        if let Some(handle) = handles.get(tenant_id) {
            handle.broken.store(true, Ordering::SeqCst);
            warn!(tenant = tenant_id, age_s = handle.opened_at.elapsed().as_secs(), "handle marked broken");
        }
    }

    /// Drop handles idle longer than `max_idle_ms`, plus any flagged broken.
    /// Returns the number removed.
    pub async fn evict_idle(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut handles = self.handles.write().await;
        let before = handles.len();
        handles.retain(|tenant, handle| {
            let keep = !handle.is_broken() && handle.idle_for() < max_idle;
            if !keep {
                debug!(tenant = %tenant, idle_s = handle.idle_for().as_secs(), "evicting idle handle");
            }
            keep
        });
        let evicted = before - handles.len();
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub async fn stats(&self) -> PoolSnapshot {
        PoolSnapshot {
            open_handles: self.handles.read().await.len(),
            connects: self.counters.connects.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drop every pooled handle (shutdown).
    pub async fn clear(&self) {
        self.handles.write().await.clear();
    }

    /// Spawn the periodic idle-eviction task. Returns its handle so shutdown
    /// can abort it.
    pub fn start_background_eviction(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = interval.as_millis(), "starting pool eviction task");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evict_idle().await;
            }
        })
    }
}
