//! Service Configuration
//!
//! This module defines configuration for every component of the layer.
//!
//! ## ServiceConfig
//!
//! One struct assembled at process start and passed into `RowService::start`:
//!
//! - **registry_refresh_interval_ms**: tenant snapshot reload period (default: 60s)
//! - **limiter**: per-plan token buckets plus the per-IP anti-abuse bucket
//! - **pool**: handle bound, idle age, connect retry budget
//! - **cache**: entry bound, byte budget, per-kind TTLs, sweep interval
//! - **queue**: batch size, linger window, retry policy, worker budget
//! - **remote_call_timeout_ms**: upper bound on any single remote call (default: 10s)
//!
//! ## Usage
//!
//! ```ignore
//! use rowgate::config::ServiceConfig;
//!
//! // Defaults tuned for a store allowing ~100 requests / 100s per tenant
//! let config = ServiceConfig::default();
//!
//! // Faster drain for tests
//! let config = ServiceConfig {
//!     queue: QueueConfig { linger_ms: 10, ..Default::default() },
//!     ..Default::default()
//! };
//! ```

use rowgate_core::{ResourceKind, TenantPlan};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token bucket parameters for one scope class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Maximum tokens (burst size).
    pub capacity: f64,
    /// Tokens regenerated per second.
    pub refill_per_sec: f64,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bucket for Free-plan tenants.
    #[serde(default = "default_free_bucket")]
    pub free: BucketParams,

    /// Bucket for Pro-plan tenants.
    #[serde(default = "default_pro_bucket")]
    pub pro: BucketParams,

    /// Bucket for Enterprise-plan tenants.
    #[serde(default = "default_enterprise_bucket")]
    pub enterprise: BucketParams,

    /// Anti-abuse bucket applied per caller IP.
    #[serde(default = "default_ip_bucket")]
    pub ip: BucketParams,

    /// Buckets unseen for this long are pruned (milliseconds).
    #[serde(default = "default_bucket_idle_ms")]
    pub idle_prune_ms: u64,
}

impl LimiterConfig {
    /// Bucket parameters for a tenant's plan.
    pub fn for_plan(&self, plan: TenantPlan) -> BucketParams {
        match plan {
            TenantPlan::Free => self.free,
            TenantPlan::Pro => self.pro,
            TenantPlan::Enterprise => self.enterprise,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            free: default_free_bucket(),
            pro: default_pro_bucket(),
            enterprise: default_enterprise_bucket(),
            ip: default_ip_bucket(),
            idle_prune_ms: default_bucket_idle_ms(),
        }
    }
}

// The remote store allows roughly 100 requests per 100s window per tenant;
// defaults keep ~20% headroom below that.
fn default_free_bucket() -> BucketParams {
    BucketParams {
        capacity: 10.0,
        refill_per_sec: 0.5,
    }
}

fn default_pro_bucket() -> BucketParams {
    BucketParams {
        capacity: 30.0,
        refill_per_sec: 0.8,
    }
}

fn default_enterprise_bucket() -> BucketParams {
    BucketParams {
        capacity: 60.0,
        refill_per_sec: 1.5,
    }
}

fn default_ip_bucket() -> BucketParams {
    BucketParams {
        capacity: 120.0,
        refill_per_sec: 4.0,
    }
}

fn default_bucket_idle_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live handles across all tenants; LRU-evicted beyond this.
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,

    /// Idle handles older than this are evicted by the sweep (milliseconds).
    #[serde(default = "default_handle_idle_ms")]
    pub max_idle_ms: u64,

    /// Attempts to open a backing document before surfacing ConnectionFailed.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Initial backoff between connect attempts (milliseconds).
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Upper bound on a single connect attempt (milliseconds). A hung open
    /// counts as a transient failure against the attempt budget.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handles: default_max_handles(),
            max_idle_ms: default_handle_idle_ms(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_max_handles() -> usize {
    64
}

fn default_handle_idle_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_connect_attempts() -> usize {
    3
}

fn default_connect_backoff_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    10 * 1000
}

/// Policy when a value's size estimate is unavailable.
///
/// Fail-open admits the entry with a zero byte estimate (the entry-count
/// bound still applies); fail-closed skips caching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingSizePolicy {
    FailOpen,
    FailClosed,
}

/// Read cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    /// Optional estimated-byte budget across all entries.
    #[serde(default)]
    pub max_bytes: Option<usize>,

    /// TTL for row reads (milliseconds).
    #[serde(default = "default_rows_ttl_ms")]
    pub rows_ttl_ms: u64,

    /// TTL for sheet metadata (milliseconds). Sheets change rarely, so this
    /// is longer than the row TTL.
    #[serde(default = "default_sheet_ttl_ms")]
    pub sheet_ttl_ms: u64,

    /// Proactive expired-entry sweep interval (milliseconds).
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,

    /// What to do when a value's size estimate is unavailable.
    #[serde(default = "default_missing_size_policy")]
    pub missing_size_policy: MissingSizePolicy,
}

impl CacheConfig {
    /// TTL policy lookup, keyed by resource kind.
    pub fn ttl_for(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Rows => Duration::from_millis(self.rows_ttl_ms),
            ResourceKind::SheetMeta => Duration::from_millis(self.sheet_ttl_ms),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            max_bytes: None,
            rows_ttl_ms: default_rows_ttl_ms(),
            sheet_ttl_ms: default_sheet_ttl_ms(),
            sweep_interval_ms: default_sweep_ms(),
            missing_size_policy: default_missing_size_policy(),
        }
    }
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_rows_ttl_ms() -> u64 {
    15 * 1000 // 15 seconds
}

fn default_sheet_ttl_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_sweep_ms() -> u64 {
    60 * 1000 // 60 seconds
}

fn default_missing_size_policy() -> MissingSizePolicy {
    MissingSizePolicy::FailOpen
}

/// Batch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Flush a batch once this many rows are coalesced.
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: usize,

    /// Linger window before the first batch of a burst drains (milliseconds).
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    /// Attempts per batch before rejecting its futures.
    #[serde(default = "default_batch_attempts")]
    pub max_attempts: usize,

    /// Initial retry backoff (milliseconds).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Backoff cap (milliseconds).
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Maximum concurrently draining queues across all tenants.
    #[serde(default = "default_worker_budget")]
    pub worker_budget: usize,
}

impl QueueConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: default_max_batch_rows(),
            linger_ms: default_linger_ms(),
            max_attempts: default_batch_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            retry_multiplier: default_retry_multiplier(),
            worker_budget: default_worker_budget(),
        }
    }
}

fn default_max_batch_rows() -> usize {
    50
}

fn default_linger_ms() -> u64 {
    200
}

fn default_batch_attempts() -> usize {
    4
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_cap_ms() -> u64 {
    10 * 1000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_worker_budget() -> usize {
    16
}

/// Top-level configuration assembled at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Tenant registry reload period (milliseconds).
    #[serde(default = "default_registry_refresh_ms")]
    pub registry_refresh_ms: u64,

    /// Upper bound on any single remote call (milliseconds). Timeouts are
    /// treated as transient failures.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_call_timeout_ms: u64,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl ServiceConfig {
    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_call_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            registry_refresh_ms: default_registry_refresh_ms(),
            remote_call_timeout_ms: default_remote_timeout_ms(),
            limiter: LimiterConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

fn default_registry_refresh_ms() -> u64 {
    60 * 1000
}

fn default_remote_timeout_ms() -> u64 {
    10 * 1000
}
