//! Service Facade
//!
//! `RowService` is the single entry point request handlers call. It wires the
//! registry, rate limiter, connection pool, read cache, invalidator and batch
//! queue together and owns their background tasks.
//!
//! ```text
//!                      ┌──────────────┐
//!     get_rows ──────→ │  RowService  │ ──→ limiter ─→ cache ─→ pool ─→ remote
//!     add_rows ──────→ │              │ ──→ limiter ─→ batch queue ─→ remote
//!     ensure_sheet ──→ └──────────────┘            (invalidation on write)
//! ```
//!
//! ## Admission
//!
//! Reads charge both the tenant and caller-IP buckets up front. Writes charge
//! only the IP bucket at accept time; the tenant bucket is charged by the
//! queue's drain task when the batch actually goes out, so a queued burst
//! cannot overdraw the tenant's remote quota.
//!
//! ## Usage
//!
//! ```ignore
//! let service = RowService::start(config, store, source).await?;
//!
//! let rows = service.get_rows("acme", Some("10.0.0.1"), "USERS", None).await?;
//! let ticket = service.add_rows("acme", Some("10.0.0.1"), "USERS", rows)?;
//! let outcome = ticket.wait().await?;
//!
//! service.shutdown().await;
//! ```

use crate::cache::{CacheKey, ReadCache};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::invalidation::Invalidator;
use crate::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::pool::ConnectionPool;
use crate::queue::{BatchQueue, WriteOp, WriteTicket};
use crate::rate_limiter::{RateLimiter, Scope};
use crate::registry::{TenantRegistry, TenantSource};
use crate::remote::{RemoteError, RowStore};
use crate::retry::{retry_with_backoff, RetryPolicy};
use rowgate_core::{CellMap, Row, RowFilter, RowPatch, RowRef, SheetRef, TenantPlan};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a per-tenant health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// The tenant's backing document is reachable.
    pub sheets_ok: bool,
    /// The read cache round-trips a probe entry.
    pub cache_ok: bool,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.sheets_ok && self.cache_ok
    }
}

/// The data-access layer: one instance per process, shared by handlers.
pub struct RowService {
    config: ServiceConfig,
    registry: Arc<TenantRegistry>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ReadCache>,
    queue: Arc<BatchQueue>,
    metrics: Arc<ServiceMetrics>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RowService {
    /// Build the service, load the initial tenant snapshot, and spawn the
    /// background refresh, sweep and eviction tasks.
    pub async fn start(
        config: ServiceConfig,
        store: Arc<dyn RowStore>,
        source: Arc<dyn TenantSource>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(TenantRegistry::new(source));
        if !registry.refresh().await {
            return Err(Error::Unavailable(
                "initial tenant registry load failed".to_string(),
            ));
        }

        let limiter = Arc::new(RateLimiter::new(config.limiter.clone()));
        let pool = Arc::new(ConnectionPool::new(
            store,
            registry.clone(),
            config.pool.clone(),
        ));
        let cache = Arc::new(ReadCache::new(config.cache.clone()));
        let invalidator = Arc::new(Invalidator::new(cache.clone()));
        let queue = Arc::new(BatchQueue::new(
            config.queue.clone(),
            config.remote_call_timeout(),
            limiter.clone(),
            registry.clone(),
            pool.clone(),
            invalidator,
        ));

        let service = Arc::new(Self {
            registry: registry.clone(),
            limiter: limiter.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            queue,
            metrics: Arc::new(ServiceMetrics::default()),
            config,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = service.tasks.lock().unwrap();
        tasks.push(registry.clone().start_background_refresh(Duration::from_millis(
            service.config.registry_refresh_ms,
        )));
        tasks.push(cache.start_background_sweep(Duration::from_millis(
            service.config.cache.sweep_interval_ms,
        )));
        tasks.push(pool.start_background_eviction(service.config.pool.max_idle()));
        {
            let limiter = limiter.clone();
            let interval = Duration::from_millis(service.config.limiter.idle_prune_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    limiter.prune_idle();
                }
            }));
        }
        drop(tasks);

        info!(tenants = registry.len().await, "row service started");
        Ok(service)
    }

    /// Admit a read: both tenant and caller-IP buckets must allow it.
    fn admit_read(&self, tenant_id: &str, plan: TenantPlan, caller_ip: Option<&str>) -> Result<()> {
        let decision = self.limiter.admit(tenant_id, plan, caller_ip, 1.0);
        match decision.retry_after() {
            None => Ok(()),
            Some(retry_after) => {
                self.metrics.record_throttled();
                Err(Error::Throttled { retry_after })
            }
        }
    }

    /// Admit a write: only the caller-IP bucket is charged here; the tenant
    /// bucket is charged when the batch drains.
    fn admit_write(&self, plan: TenantPlan, caller_ip: Option<&str>) -> Result<()> {
        let Some(ip) = caller_ip else { return Ok(()) };
        let decision = self
            .limiter
            .try_acquire(Scope::Ip(ip.to_string()), plan, 1.0);
        match decision.retry_after() {
            None => Ok(()),
            Some(retry_after) => {
                self.metrics.record_throttled();
                Err(Error::Throttled { retry_after })
            }
        }
    }

    /// Run one remote call under the global timeout and transient-retry
    /// policy, flagging the tenant's handle on auth failures.
    async fn remote_call<T, F, Fut>(&self, tenant_id: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let policy = RetryPolicy::new(
            self.config.queue.max_attempts,
            Duration::from_millis(self.config.queue.retry_base_ms),
            Duration::from_millis(self.config.queue.retry_cap_ms),
            self.config.queue.retry_multiplier,
        );
        let timeout = self.config.remote_call_timeout();

        let result = retry_with_backoff(&policy, || {
            let fut = call();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(format!(
                        "remote call exceeded {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.breaks_handle() {
                    self.pool.mark_broken(tenant_id).await;
                }
                self.metrics.record_error();
                Err(Error::from_remote(err))
            }
        }
    }

    /// Create a sheet in the tenant's document if it does not exist,
    /// declaring its header row. Idempotent; a recent ensure with the same
    /// header is served from the metadata cache without a remote call.
    pub async fn ensure_sheet(
        &self,
        tenant_id: &str,
        caller_ip: Option<&str>,
        title: &str,
        header: &[String],
    ) -> Result<SheetRef> {
        let tenant = self.registry.resolve_enabled(tenant_id).await?;
        self.admit_read(tenant_id, tenant.plan, caller_ip)?;

        let key = CacheKey::sheet_meta(tenant_id, title);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(sheet) = serde_json::from_value::<SheetRef>(value) {
                if sheet.header == header {
                    return Ok(sheet);
                }
            }
            // Header changed or entry undeserializable: re-ensure remotely.
            self.cache.invalidate(&key);
        }

        let client = self.pool.acquire(tenant_id).await?;
        self.remote_call(tenant_id, || client.ensure_sheet(title, header))
            .await?;

        // A (re)created sheet obsoletes whatever was cached under its name.
        self.cache.invalidate_sheet(tenant_id, title);
        debug!(tenant = tenant_id, sheet = title, "sheet ensured");
        let sheet = SheetRef {
            tenant_id: tenant_id.to_string(),
            title: title.to_string(),
            header: header.to_vec(),
        };
        match serde_json::to_value(&sheet) {
            Ok(value) => self.cache.insert(key, value),
            Err(err) => warn!(error = %err, "sheet metadata not cacheable"),
        }
        Ok(sheet)
    }

    /// Read rows from a sheet, serving from cache when fresh.
    pub async fn get_rows(
        &self,
        tenant_id: &str,
        caller_ip: Option<&str>,
        sheet: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        let tenant = self.registry.resolve_enabled(tenant_id).await?;
        self.admit_read(tenant_id, tenant.plan, caller_ip)?;

        let key = CacheKey::rows(tenant_id, sheet, filter);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(rows) = serde_json::from_value::<Vec<Row>>(value) {
                self.metrics.record_read(started.elapsed());
                return Ok(rows);
            }
            // Undeserializable entry: drop it and fall through to the remote.
            self.cache.invalidate(&key);
        }

        let client = self.pool.acquire(tenant_id).await?;
        let rows = self
            .remote_call(tenant_id, || client.get_rows(sheet, filter))
            .await?;

        match serde_json::to_value(&rows) {
            Ok(value) => self.cache.insert(key, value),
            Err(err) => warn!(error = %err, "rows not cacheable"),
        }
        self.metrics.record_read(started.elapsed());
        Ok(rows)
    }

    /// Queue an append. The ticket resolves with the store-assigned row
    /// references once the batch lands.
    pub async fn add_rows(
        &self,
        tenant_id: &str,
        caller_ip: Option<&str>,
        sheet: &str,
        rows: Vec<CellMap>,
    ) -> Result<WriteTicket> {
        let started = Instant::now();
        let tenant = self.registry.resolve_enabled(tenant_id).await?;
        self.admit_write(tenant.plan, caller_ip)?;
        let ticket = self.queue.enqueue(tenant_id, sheet, WriteOp::AddRows { rows })?;
        self.metrics.record_write(started.elapsed());
        Ok(ticket)
    }

    /// Queue a cell patch against an existing row.
    pub async fn update_row(
        &self,
        tenant_id: &str,
        caller_ip: Option<&str>,
        sheet: &str,
        row_ref: RowRef,
        patch: RowPatch,
    ) -> Result<WriteTicket> {
        let started = Instant::now();
        let tenant = self.registry.resolve_enabled(tenant_id).await?;
        self.admit_write(tenant.plan, caller_ip)?;
        let ticket = self
            .queue
            .enqueue(tenant_id, sheet, WriteOp::UpdateRow { row_ref, patch })?;
        self.metrics.record_write(started.elapsed());
        Ok(ticket)
    }

    /// Queue a row removal.
    pub async fn delete_row(
        &self,
        tenant_id: &str,
        caller_ip: Option<&str>,
        sheet: &str,
        row_ref: RowRef,
    ) -> Result<WriteTicket> {
        let started = Instant::now();
        let tenant = self.registry.resolve_enabled(tenant_id).await?;
        self.admit_write(tenant.plan, caller_ip)?;
        let ticket = self
            .queue
            .enqueue(tenant_id, sheet, WriteOp::DeleteRow { row_ref })?;
        self.metrics.record_write(started.elapsed());
        Ok(ticket)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.cache.stats())
    }

    /// Probe one tenant end to end: a pool acquire for document reachability
    /// and a cache round-trip.
    pub async fn health_check(&self, tenant_id: &str) -> Health {
        let sheets_ok = self.pool.acquire(tenant_id).await.is_ok();

        let probe = CacheKey::sheet_meta(tenant_id, "__health_probe__");
        self.cache.insert(probe.clone(), serde_json::json!("ok"));
        let cache_ok = self.cache.get(&probe).is_some();
        self.cache.invalidate(&probe);

        Health { sheets_ok, cache_ok }
    }

    /// Graceful shutdown: stop accepting writes, drain every lane, then stop
    /// background tasks and drop pooled state.
    pub async fn shutdown(&self) {
        info!("row service shutting down");
        self.queue.flush_and_close().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        self.pool.clear().await;
        self.cache.clear();
        info!("row service stopped");
    }
}
