//! Write-Triggered Cache Invalidation
//!
//! Keeps the read cache coherent with completed writes. After a mutation
//! batch is applied remotely, every cached entry derived from the written
//! sheet — the full-sheet read, every filtered view, the sheet metadata —
//! is removed before the write's caller is told it succeeded, so a read
//! issued after a confirmed write can never observe the pre-write state.
//!
//! Invalidation is deliberately coarse: the write path cannot know which
//! filtered views a row change affects, so the whole sheet namespace goes.
//! The next read repopulates from the remote store.

use crate::cache::ReadCache;
use rowgate_core::WriteKind;
use std::sync::Arc;
use tracing::debug;

/// Bridges completed writes to cache removal.
pub struct Invalidator {
    cache: Arc<ReadCache>,
}

impl Invalidator {
    pub fn new(cache: Arc<ReadCache>) -> Self {
        Self { cache }
    }

    /// Called by the write pipeline after a batch lands remotely and before
    /// its tickets resolve.
    pub fn on_write_completed(
        &self,
        tenant_id: &str,
        sheet: &str,
        kind: WriteKind,
        affected_rows: usize,
    ) {
        let removed = self.cache.invalidate_sheet(tenant_id, sheet);
        debug!(
            tenant = tenant_id,
            sheet = sheet,
            kind = %kind,
            rows = affected_rows,
            invalidated = removed,
            "write completed, sheet cache dropped"
        );
    }

    /// Called after a sheet is created or its header changes, dropping stale
    /// metadata alongside any row views.
    pub fn on_sheet_changed(&self, tenant_id: &str, sheet: &str) {
        self.cache.invalidate_sheet(tenant_id, sheet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::config::CacheConfig;
    use serde_json::json;

    #[test]
    fn test_write_drops_only_the_written_sheet() {
        let cache = Arc::new(ReadCache::new(CacheConfig::default()));
        let invalidator = Invalidator::new(cache.clone());

        let written = CacheKey::rows("t1", "USERS", None);
        let meta = CacheKey::sheet_meta("t1", "USERS");
        let untouched = CacheKey::rows("t1", "ORDERS", None);
        let other_tenant = CacheKey::rows("t2", "USERS", None);
        for key in [&written, &meta, &untouched, &other_tenant] {
            cache.insert(key.clone(), json!("v"));
        }

        invalidator.on_write_completed("t1", "USERS", WriteKind::AddRows, 3);

        assert!(cache.get(&written).is_none());
        assert!(cache.get(&meta).is_none());
        assert!(cache.get(&untouched).is_some());
        assert!(cache.get(&other_tenant).is_some());
    }

    #[test]
    fn test_sheet_change_drops_metadata() {
        let cache = Arc::new(ReadCache::new(CacheConfig::default()));
        let invalidator = Invalidator::new(cache.clone());

        let meta = CacheKey::sheet_meta("t1", "CONFIG");
        cache.insert(meta.clone(), json!({"header": ["a", "b"]}));

        invalidator.on_sheet_changed("t1", "CONFIG");
        assert!(cache.get(&meta).is_none());
    }
}
