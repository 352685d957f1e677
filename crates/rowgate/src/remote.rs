//! Remote Row-Store Boundary
//!
//! This module defines the trait seam between the layer and the remote,
//! quota-limited row store, plus an in-memory implementation used by tests
//! and local development.
//!
//! ## The Seam
//!
//! ```text
//! ┌────────────────┐   load_document    ┌─────────────────┐
//! │  RowStore      │ ─────────────────→ │ DocumentClient  │
//! │  (per process) │                    │ (per tenant)    │
//! └────────────────┘                    └───────┬─────────┘
//!                                               │
//!                            ensure_sheet / get_rows / add_rows /
//!                                  update_row / delete_row
//! ```
//!
//! Every call may fail with `QuotaExceeded` or `Unavailable` (transient,
//! retried by the caller) or `Invalid` (terminal, never retried). Opening a
//! document may additionally fail with `Auth` or `NotFound`.
//!
//! ## Error Classification
//!
//! `RemoteError::is_transient()` is the single source of truth for what the
//! retry machinery may re-attempt:
//!
//! - **Transient**: `QuotaExceeded`, `Unavailable`, `Timeout`
//! - **Terminal**: `Auth`, `NotFound`, `Invalid`
//!
//! ## InMemoryRowStore
//!
//! `memory::InMemoryRowStore` keeps documents and sheets in process memory,
//! records every call it serves, and supports scripted fault injection
//! ("fail the next N calls with error E"). Integration tests use it to verify
//! retry telemetry — exactly one successful payload after N failures.

use async_trait::async_trait;
use rowgate_core::{CellMap, Row, RowFilter, RowPatch, RowRef};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the remote store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl RemoteError {
    /// Whether the retry machinery may re-attempt the call.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::QuotaExceeded(_) => true,
            RemoteError::Unavailable(_) => true,
            RemoteError::Timeout(_) => true,

            RemoteError::Auth(_) => false,
            RemoteError::NotFound(_) => false,
            RemoteError::Invalid(_) => false,
        }
    }

    /// Whether the error indicates the connection handle itself is unusable.
    pub fn breaks_handle(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }
}

/// Factory for per-tenant document handles.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Open a tenant's backing document with its credentials.
    async fn load_document(
        &self,
        document_id: &str,
        credentials_ref: &str,
    ) -> Result<Arc<dyn DocumentClient>, RemoteError>;
}

/// Authenticated handle to one backing document.
///
/// Reads are side-effect-free and may run concurrently on a shared handle;
/// writes are serialized upstream by the batch queue.
#[async_trait]
pub trait DocumentClient: Send + Sync + std::fmt::Debug {
    /// Create the sheet if absent, declaring its header row.
    async fn ensure_sheet(&self, title: &str, header: &[String]) -> Result<(), RemoteError>;

    /// Read rows, optionally filtered.
    async fn get_rows(
        &self,
        sheet: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<Row>, RemoteError>;

    /// Append rows; the store assigns row references.
    async fn add_rows(&self, sheet: &str, rows: &[CellMap]) -> Result<Vec<RowRef>, RemoteError>;

    /// Patch cells of an existing row.
    async fn update_row(
        &self,
        sheet: &str,
        row_ref: RowRef,
        patch: &RowPatch,
    ) -> Result<(), RemoteError>;

    /// Remove a row.
    async fn delete_row(&self, sheet: &str, row_ref: RowRef) -> Result<(), RemoteError>;
}

pub mod memory {
    //! In-memory row store with call recording and fault injection.

    use super::*;
    use rowgate_core::WriteKind;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// What a recorded call was doing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CallKind {
        LoadDocument,
        EnsureSheet,
        GetRows,
        AddRows,
        UpdateRow,
        DeleteRow,
    }

    impl From<WriteKind> for CallKind {
        fn from(kind: WriteKind) -> Self {
            match kind {
                WriteKind::AddRows => CallKind::AddRows,
                WriteKind::UpdateRow => CallKind::UpdateRow,
                WriteKind::DeleteRow => CallKind::DeleteRow,
            }
        }
    }

    /// One recorded remote call.
    #[derive(Debug, Clone)]
    pub struct CallRecord {
        pub kind: CallKind,
        pub document_id: String,
        pub sheet: String,
        /// Rows carried by the call (0 for non-batch calls).
        pub rows: usize,
        pub ok: bool,
    }

    #[derive(Debug, Default)]
    struct Shared {
        /// Scripted failures consumed by data calls, front first.
        data_faults: Mutex<VecDeque<RemoteError>>,
        /// Scripted failures consumed by `load_document`.
        load_faults: Mutex<VecDeque<RemoteError>>,
        calls: Mutex<Vec<CallRecord>>,
        next_ref: AtomicU64,
    }

    impl Shared {
        fn take_data_fault(&self) -> Option<RemoteError> {
            self.data_faults.lock().unwrap().pop_front()
        }

        fn record(&self, record: CallRecord) {
            self.calls.lock().unwrap().push(record);
        }
    }

    #[derive(Debug, Default)]
    struct SheetData {
        header: Vec<String>,
        rows: Vec<Row>,
    }

    /// In-memory implementation of [`RowStore`].
    ///
    /// Documents are created on first load. All documents share one fault
    /// queue and one call log so tests can script and inspect the whole
    /// exchange in order.
    #[derive(Default)]
    pub struct InMemoryRowStore {
        shared: Arc<Shared>,
        docs: Mutex<HashMap<String, Arc<MemoryDocument>>>,
    }

    impl InMemoryRowStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` data calls (any sheet operation) with clones of `err`.
        pub fn fail_next(&self, n: usize, err: RemoteError) {
            let mut faults = self.shared.data_faults.lock().unwrap();
            for _ in 0..n {
                faults.push_back(err.clone());
            }
        }

        /// Fail the next `n` `load_document` calls with clones of `err`.
        pub fn fail_next_loads(&self, n: usize, err: RemoteError) {
            let mut faults = self.shared.load_faults.lock().unwrap();
            for _ in 0..n {
                faults.push_back(err.clone());
            }
        }

        /// Everything the store has been asked to do, in order.
        pub fn calls(&self) -> Vec<CallRecord> {
            self.shared.calls.lock().unwrap().clone()
        }

        /// Recorded calls of one kind, in order.
        pub fn calls_of(&self, kind: CallKind) -> Vec<CallRecord> {
            self.calls().into_iter().filter(|c| c.kind == kind).collect()
        }
    }

    #[async_trait]
    impl RowStore for InMemoryRowStore {
        async fn load_document(
            &self,
            document_id: &str,
            _credentials_ref: &str,
        ) -> Result<Arc<dyn DocumentClient>, RemoteError> {
            if let Some(err) = self.shared.load_faults.lock().unwrap().pop_front() {
                self.shared.record(CallRecord {
                    kind: CallKind::LoadDocument,
                    document_id: document_id.to_string(),
                    sheet: String::new(),
                    rows: 0,
                    ok: false,
                });
                return Err(err);
            }

            let doc = {
                let mut docs = self.docs.lock().unwrap();
                docs.entry(document_id.to_string())
                    .or_insert_with(|| {
                        Arc::new(MemoryDocument {
                            document_id: document_id.to_string(),
                            shared: Arc::clone(&self.shared),
                            sheets: Mutex::new(HashMap::new()),
                        })
                    })
                    .clone()
            };

            self.shared.record(CallRecord {
                kind: CallKind::LoadDocument,
                document_id: document_id.to_string(),
                sheet: String::new(),
                rows: 0,
                ok: true,
            });
            Ok(doc)
        }
    }

    /// One in-memory backing document.
    #[derive(Debug)]
    pub struct MemoryDocument {
        document_id: String,
        shared: Arc<Shared>,
        sheets: Mutex<HashMap<String, SheetData>>,
    }

    impl MemoryDocument {
        /// Consume a scripted fault if one is queued, recording the failed call.
        fn check_fault(&self, kind: CallKind, sheet: &str, rows: usize) -> Result<(), RemoteError> {
            if let Some(err) = self.shared.take_data_fault() {
                self.shared.record(CallRecord {
                    kind,
                    document_id: self.document_id.clone(),
                    sheet: sheet.to_string(),
                    rows,
                    ok: false,
                });
                return Err(err);
            }
            Ok(())
        }

        fn record_ok(&self, kind: CallKind, sheet: &str, rows: usize) {
            self.shared.record(CallRecord {
                kind,
                document_id: self.document_id.clone(),
                sheet: sheet.to_string(),
                rows,
                ok: true,
            });
        }
    }

    #[async_trait]
    impl DocumentClient for MemoryDocument {
        async fn ensure_sheet(&self, title: &str, header: &[String]) -> Result<(), RemoteError> {
            self.check_fault(CallKind::EnsureSheet, title, 0)?;
            let mut sheets = self.sheets.lock().unwrap();
            sheets.entry(title.to_string()).or_insert_with(|| SheetData {
                header: header.to_vec(),
                rows: Vec::new(),
            });
            drop(sheets);
            self.record_ok(CallKind::EnsureSheet, title, 0);
            Ok(())
        }

        async fn get_rows(
            &self,
            sheet: &str,
            filter: Option<&RowFilter>,
        ) -> Result<Vec<Row>, RemoteError> {
            self.check_fault(CallKind::GetRows, sheet, 0)?;
            let sheets = self.sheets.lock().unwrap();
            let rows = match sheets.get(sheet) {
                Some(data) => data
                    .rows
                    .iter()
                    .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            drop(sheets);
            self.record_ok(CallKind::GetRows, sheet, 0);
            Ok(rows)
        }

        async fn add_rows(&self, sheet: &str, rows: &[CellMap]) -> Result<Vec<RowRef>, RemoteError> {
            self.check_fault(CallKind::AddRows, sheet, rows.len())?;
            let mut sheets = self.sheets.lock().unwrap();
            let data = sheets.entry(sheet.to_string()).or_default();
            let mut refs = Vec::with_capacity(rows.len());
            for cells in rows {
                let row_ref = RowRef(self.shared.next_ref.fetch_add(1, Ordering::SeqCst) + 1);
                data.rows.push(Row::new(row_ref, cells.clone()));
                refs.push(row_ref);
            }
            drop(sheets);
            self.record_ok(CallKind::AddRows, sheet, rows.len());
            Ok(refs)
        }

        async fn update_row(
            &self,
            sheet: &str,
            row_ref: RowRef,
            patch: &RowPatch,
        ) -> Result<(), RemoteError> {
            self.check_fault(CallKind::UpdateRow, sheet, 1)?;
            let mut sheets = self.sheets.lock().unwrap();
            let row = sheets
                .get_mut(sheet)
                .and_then(|data| data.rows.iter_mut().find(|r| r.row_ref == row_ref));
            match row {
                Some(row) => {
                    for (col, value) in patch {
                        row.cells.insert(col.clone(), value.clone());
                    }
                    drop(sheets);
                    self.record_ok(CallKind::UpdateRow, sheet, 1);
                    Ok(())
                }
                None => Err(RemoteError::Invalid(format!(
                    "{row_ref} not found in sheet {sheet}"
                ))),
            }
        }

        async fn delete_row(&self, sheet: &str, row_ref: RowRef) -> Result<(), RemoteError> {
            self.check_fault(CallKind::DeleteRow, sheet, 1)?;
            let mut sheets = self.sheets.lock().unwrap();
            let removed = sheets
                .get_mut(sheet)
                .map(|data| {
                    let before = data.rows.len();
                    data.rows.retain(|r| r.row_ref != row_ref);
                    data.rows.len() < before
                })
                .unwrap_or(false);
            drop(sheets);
            if removed {
                self.record_ok(CallKind::DeleteRow, sheet, 1);
                Ok(())
            } else {
                Err(RemoteError::Invalid(format!(
                    "{row_ref} not found in sheet {sheet}"
                )))
            }
        }
    }
}
