//! Rowgate Core Types
//!
//! Shared domain types for the rowgate data-access layer. This crate holds the
//! value types that cross component boundaries — tenant configuration, rows and
//! row addressing, write kinds, and cache resource kinds — with no I/O and no
//! async surface.
//!
//! Everything here is a plain value: cheap to clone, serde-serializable, and
//! safe to hold across await points in the service crate.

pub mod types;

pub use types::{
    CellMap, OpId, ResourceKind, Row, RowFilter, RowPatch, RowRef, SheetRef, TenantConfig,
    TenantPlan, WriteKind,
};
