//! Tenant Registry
//!
//! Resolves a tenant identifier to its connection credentials and metadata
//! (plan, enabled flag, backing-document id), refreshed periodically from a
//! declarative source.
//!
//! ## Snapshot Semantics
//!
//! Each refresh builds a complete new map and swaps it in atomically — a
//! reader sees either the whole old snapshot or the whole new one, never a
//! partial update. A failed refresh keeps the previous snapshot (fail-open to
//! last-known-good) and logs; a transient reload error must never take every
//! tenant offline.
//!
//! ## Usage
//!
//! ```ignore
//! use rowgate::registry::{StaticTenantSource, TenantRegistry};
//!
//! let source = Arc::new(StaticTenantSource::new(tenants));
//! let registry = Arc::new(TenantRegistry::new(source));
//! registry.refresh().await?;               // startup load
//! registry.clone().start_background_refresh(Duration::from_secs(60));
//!
//! let config = registry.resolve("acme")?;  // Arc<TenantConfig> snapshot
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use rowgate_core::TenantConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Declarative source of tenant configuration.
#[async_trait]
pub trait TenantSource: Send + Sync {
    /// Load the full tenant set. Called on startup and on every refresh tick.
    async fn load(&self) -> std::result::Result<Vec<TenantConfig>, String>;
}

/// Fixed tenant set, for tests and single-file deployments.
pub struct StaticTenantSource {
    tenants: std::sync::Mutex<Vec<TenantConfig>>,
}

impl StaticTenantSource {
    pub fn new(tenants: Vec<TenantConfig>) -> Self {
        Self {
            tenants: std::sync::Mutex::new(tenants),
        }
    }

    /// Replace the tenant set served by the next load.
    pub fn set(&self, tenants: Vec<TenantConfig>) {
        *self.tenants.lock().unwrap() = tenants;
    }
}

#[async_trait]
impl TenantSource for StaticTenantSource {
    async fn load(&self) -> std::result::Result<Vec<TenantConfig>, String> {
        Ok(self.tenants.lock().unwrap().clone())
    }
}

type Snapshot = Arc<HashMap<String, Arc<TenantConfig>>>;

/// Registry of tenant configurations with periodic refresh.
pub struct TenantRegistry {
    source: Arc<dyn TenantSource>,
    snapshot: RwLock<Snapshot>,
}

impl TenantRegistry {
    pub fn new(source: Arc<dyn TenantSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Resolve a tenant to its current config snapshot.
    pub async fn resolve(&self, tenant_id: &str) -> Result<Arc<TenantConfig>> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))
    }

    /// Whether a tenant exists and is enabled.
    pub async fn is_enabled(&self, tenant_id: &str) -> bool {
        let snapshot = self.snapshot.read().await;
        snapshot.get(tenant_id).map(|t| t.enabled).unwrap_or(false)
    }

    /// Resolve a tenant, rejecting disabled tenants before any downstream
    /// component is touched.
    pub async fn resolve_enabled(&self, tenant_id: &str) -> Result<Arc<TenantConfig>> {
        let config = self.resolve(tenant_id).await?;
        if !config.enabled {
            return Err(Error::TenantDisabled(tenant_id.to_string()));
        }
        Ok(config)
    }

    /// Reload configuration from the source, swapping the snapshot atomically.
    ///
    /// On source failure the previous snapshot is retained.
    pub async fn refresh(&self) -> bool {
        match self.source.load().await {
            Ok(tenants) => {
                let count = tenants.len();
                let next: HashMap<String, Arc<TenantConfig>> = tenants
                    .into_iter()
                    .map(|t| (t.tenant_id.clone(), Arc::new(t)))
                    .collect();
                *self.snapshot.write().await = Arc::new(next);
                debug!(tenants = count, "tenant registry refreshed");
                true
            }
            Err(err) => {
                warn!(error = %err, "tenant refresh failed, keeping previous snapshot");
                false
            }
        }
    }

    /// Number of known tenants in the current snapshot.
    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn the periodic refresh task. Returns its handle so shutdown can
    /// abort it.
    pub fn start_background_refresh(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = interval.as_millis(), "starting tenant refresh task");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it, the startup refresh
            // already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_core::TenantPlan;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tenant(id: &str, enabled: bool) -> TenantConfig {
        TenantConfig {
            tenant_id: id.to_string(),
            document_id: format!("doc-{id}"),
            credentials_ref: format!("secret/{id}"),
            plan: TenantPlan::Pro,
            enabled,
            refreshed_at: 0,
        }
    }

    #[tokio::test]
    async fn test_resolve_after_refresh() {
        let source = Arc::new(StaticTenantSource::new(vec![tenant("t1", true)]));
        let registry = TenantRegistry::new(source);
        registry.refresh().await;

        let config = registry.resolve("t1").await.unwrap();
        assert_eq!(config.document_id, "doc-t1");
    }

    #[tokio::test]
    async fn test_unknown_tenant_not_found() {
        let source = Arc::new(StaticTenantSource::new(vec![]));
        let registry = TenantRegistry::new(source);
        registry.refresh().await;

        let err = registry.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_tenant_rejected() {
        let source = Arc::new(StaticTenantSource::new(vec![tenant("t1", false)]));
        let registry = TenantRegistry::new(source);
        registry.refresh().await;

        assert!(!registry.is_enabled("t1").await);
        let err = registry.resolve_enabled("t1").await.unwrap_err();
        assert!(matches!(err, Error::TenantDisabled(_)));
        // resolve still works, only resolve_enabled rejects
        assert!(registry.resolve("t1").await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_swaps_whole_snapshot() {
        let source = Arc::new(StaticTenantSource::new(vec![tenant("t1", true)]));
        let registry = TenantRegistry::new(source.clone());
        registry.refresh().await;
        assert_eq!(registry.len().await, 1);

        source.set(vec![tenant("t2", true), tenant("t3", true)]);
        registry.refresh().await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.resolve("t1").await.is_err());
        assert!(registry.resolve("t2").await.is_ok());
    }

    /// Source that fails on demand.
    struct FlakySource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl TenantSource for FlakySource {
        async fn load(&self) -> std::result::Result<Vec<TenantConfig>, String> {
            if self.fail.load(Ordering::SeqCst) {
                Err("source unreachable".to_string())
            } else {
                Ok(vec![tenant("t1", true)])
            }
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_known_good() {
        let source = Arc::new(FlakySource {
            fail: AtomicBool::new(false),
        });
        let registry = TenantRegistry::new(source.clone());
        assert!(registry.refresh().await);
        assert!(registry.resolve("t1").await.is_ok());

        source.fail.store(true, Ordering::SeqCst);
        assert!(!registry.refresh().await);

        // Previous snapshot still serves
        assert!(registry.resolve("t1").await.is_ok());
    }
}
