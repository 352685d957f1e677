//! Domain Types
//!
//! Value types shared across the rowgate layer:
//!
//! - **Tenancy**: `TenantConfig` and `TenantPlan` describe one isolated
//!   customer and the rate-limit tier they bought.
//! - **Rows**: `Row`, `RowRef`, `RowPatch`, and `RowFilter` address and shape
//!   the data held in a tenant's backing document.
//! - **Caching**: `ResourceKind` keys the per-kind TTL policy.
//! - **Writes**: `WriteKind` and `OpId` identify queued mutations.
//!
//! A `TenantConfig` snapshot is immutable once published by the registry; a
//! refresh replaces the whole snapshot rather than mutating it in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Rate-limit tier for a tenant.
///
/// Determines the token-bucket capacity and refill rate the rate limiter
/// assigns to the tenant's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenantPlan {
    Free,
    Pro,
    Enterprise,
}

impl fmt::Display for TenantPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantPlan::Free => write!(f, "free"),
            TenantPlan::Pro => write!(f, "pro"),
            TenantPlan::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Configuration for one tenant, as loaded by the registry.
///
/// Immutable during a refresh cycle; the registry swaps whole snapshots so a
/// partially-applied refresh is never visible. A disabled tenant never yields
/// a usable connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Unique tenant identifier.
    pub tenant_id: String,

    /// Identifier of the tenant's backing document in the remote store.
    pub document_id: String,

    /// Reference to the credentials used to open the backing document
    /// (a secret name, never the secret itself).
    pub credentials_ref: String,

    /// Rate-limit tier.
    pub plan: TenantPlan,

    /// Disabled tenants are rejected before any downstream component is touched.
    pub enabled: bool,

    /// When this snapshot was loaded (milliseconds since Unix epoch).
    pub refreshed_at: u64,
}

/// Named cells of one row.
pub type CellMap = BTreeMap<String, Value>;

/// Stable identity of a row within one sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowRef(pub u64);

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row-{}", self.0)
    }
}

/// One row of a sheet: a stable reference plus named cells.
///
/// Cells use `BTreeMap` so the serialized form is canonical — filter hashing
/// and test assertions rely on deterministic ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_ref: RowRef,
    pub cells: CellMap,
}

impl Row {
    pub fn new(row_ref: RowRef, cells: CellMap) -> Self {
        Self { row_ref, cells }
    }

    /// Rough serialized-size estimate, used by the cache byte budget.
    pub fn size_estimate(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// Partial cell update applied by `update_row`. Absent columns are untouched.
pub type RowPatch = CellMap;

/// Equality filter for `get_rows`.
///
/// Filters participate in the cache key via a canonical encoding, so two
/// requests with the same filter share one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Column name to match.
    pub column: String,
    /// Value the column must equal.
    pub equals: Value,
}

impl RowFilter {
    pub fn new(column: impl Into<String>, equals: Value) -> Self {
        Self {
            column: column.into(),
            equals,
        }
    }

    /// Canonical encoding used for cache-key hashing.
    pub fn canonical(&self) -> String {
        format!("{}={}", self.column, self.equals)
    }

    /// Whether a row passes this filter.
    pub fn matches(&self, row: &Row) -> bool {
        row.cells.get(&self.column) == Some(&self.equals)
    }
}

/// Kind of cached resource, keying the TTL policy.
///
/// A finite enum rather than string-keyed configuration so the policy table
/// stays type-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Row reads (full sheet or filtered view).
    Rows,
    /// Sheet existence/header metadata.
    SheetMeta,
}

impl ResourceKind {
    /// Stable short name used inside cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Rows => "rows",
            ResourceKind::SheetMeta => "sheet",
        }
    }
}

/// Kind of a queued mutation. Only same-kind operations coalesce into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    AddRows,
    UpdateRow,
    DeleteRow,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::AddRows => write!(f, "add_rows"),
            WriteKind::UpdateRow => write!(f, "update_row"),
            WriteKind::DeleteRow => write!(f, "delete_row"),
        }
    }
}

/// Process-unique identifier for an accepted write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Reference to an ensured sheet, returned by `ensure_sheet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRef {
    pub tenant_id: String,
    pub title: String,
    pub header: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: u64, col: &str, val: &str) -> Row {
        let mut cells = BTreeMap::new();
        cells.insert(col.to_string(), json!(val));
        Row::new(RowRef(id), cells)
    }

    #[test]
    fn test_filter_matches() {
        let r = row(1, "status", "active");
        assert!(RowFilter::new("status", json!("active")).matches(&r));
        assert!(!RowFilter::new("status", json!("inactive")).matches(&r));
        assert!(!RowFilter::new("missing", json!("active")).matches(&r));
    }

    #[test]
    fn test_filter_canonical_is_deterministic() {
        let a = RowFilter::new("status", json!("active"));
        let b = RowFilter::new("status", json!("active"));
        assert_eq!(a.canonical(), b.canonical());
        assert_ne!(
            a.canonical(),
            RowFilter::new("status", json!("other")).canonical()
        );
    }

    #[test]
    fn test_row_size_estimate_nonzero() {
        let r = row(7, "k", "v");
        assert!(r.size_estimate() > 0);
    }

    #[test]
    fn test_resource_kind_names_are_distinct() {
        assert_ne!(ResourceKind::Rows.as_str(), ResourceKind::SheetMeta.as_str());
    }

    #[test]
    fn test_tenant_config_serde_roundtrip() {
        let cfg = TenantConfig {
            tenant_id: "t1".to_string(),
            document_id: "doc-1".to_string(),
            credentials_ref: "secret/t1".to_string(),
            plan: TenantPlan::Pro,
            enabled: true,
            refreshed_at: 42,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TenantConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_plan_display() {
        assert_eq!(TenantPlan::Free.to_string(), "free");
        assert_eq!(TenantPlan::Enterprise.to_string(), "enterprise");
    }
}
