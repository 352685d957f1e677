//! # Rowgate
//!
//! A multi-tenant data-access layer between request handlers and a remote,
//! heavily rate-limited row store. Handlers call one facade; everything the
//! remote store's quotas demand — admission control, connection reuse, read
//! caching, write batching and retries — happens behind it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RowService                           │
//! │                                                             │
//! │  reads:   registry → limiter → cache ──miss──→ pool ──────┐ │
//! │  writes:  registry → limiter → batch queue → pool ────────┤ │
//! │                          │                                │ │
//! │                          └── invalidation ← write landed  │ │
//! └───────────────────────────────────────────────────────────┼─┘
//!                                                             ▼
//!                                                 remote row store
//!                                               (quota per tenant)
//! ```
//!
//! - [`registry`] — tenant id → credentials, plan, enabled flag; periodic
//!   fail-open refresh.
//! - [`rate_limiter`] — token buckets per tenant plan and caller IP, with
//!   retry-after hints.
//! - [`pool`] — one remote document handle per tenant, broken-handle
//!   eviction, bounded connect retries.
//! - [`cache`] — tenant-namespaced TTL/LRU read cache.
//! - [`queue`] — per-(tenant, sheet) FIFO write lanes with batching,
//!   admission and whole-batch retry.
//! - [`invalidation`] — drops a sheet's cache entries before its write
//!   tickets resolve, so confirmed writes are always visible.
//! - [`facade`] — [`RowService`], the single entry point.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rowgate::{RowService, ServiceConfig};
//! use rowgate::registry::StaticTenantSource;
//! use rowgate::remote::memory::InMemoryRowStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> rowgate::Result<()> {
//! let store = Arc::new(InMemoryRowStore::new());
//! let source = Arc::new(StaticTenantSource::new(tenants));
//! let service = RowService::start(ServiceConfig::default(), store, source).await?;
//!
//! let rows = service.get_rows("acme", Some("10.0.0.1"), "USERS", None).await?;
//! let ticket = service.add_rows("acme", Some("10.0.0.1"), "USERS", new_rows).await?;
//! ticket.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod invalidation;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod rate_limiter;
pub mod registry;
pub mod remote;
pub mod retry;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use facade::{Health, RowService};
pub use metrics::MetricsSnapshot;
pub use queue::{BatchPhase, WriteOp, WriteOutcome, WriteTicket};

pub use rowgate_core::{
    CellMap, OpId, ResourceKind, Row, RowFilter, RowPatch, RowRef, SheetRef, TenantConfig,
    TenantPlan, WriteKind,
};
