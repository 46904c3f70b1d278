//! Ledger sinks. The ledger is append/upsert only: rows are inserted or
//! overwritten in place, never deleted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use hsync_adapters::DateWindow;
use hsync_core::{Fingerprint, RecordIdentity, Source, UnifiedRecord};
use tokio::sync::Mutex;

use crate::merge::{LedgerOp, SinkWriteError, WriteMode};

mod parquet_ledger;
mod postgres_ledger;

pub use parquet_ledger::ParquetLedger;
pub use postgres_ledger::PostgresLedger;

#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Human-readable target, for logs and reports.
    fn describe(&self) -> String;

    fn write_mode(&self) -> WriteMode;

    /// Identities and fingerprints of the rows whose date falls in `span`
    /// (all rows when `None`).
    async fn read_identities(&self, span: Option<DateWindow>) -> Result<HashMap<RecordIdentity, Fingerprint>>;

    async fn apply_batch(&self, ops: &[LedgerOp]) -> Result<(), SinkWriteError>;

    /// Writes and reads back a single probe row without leaving it visible.
    async fn verify_write_access(&self) -> Result<()>;
}

/// Row used by `verify_write_access` round trips.
pub(crate) fn probe_record() -> UnifiedRecord {
    UnifiedRecord {
        steps: Some(1),
        ..UnifiedRecord::new(NaiveDate::default(), Source::Oura, "hsync-verify-probe")
    }
}

pub(crate) fn in_span(date: NaiveDate, span: Option<&DateWindow>) -> bool {
    span.map_or(true, |w| w.contains(date))
}

/// In-process ledger. Write mode and failures are configurable.
#[derive(Debug)]
pub struct MemoryLedger {
    rows: Mutex<BTreeMap<RecordIdentity, UnifiedRecord>>,
    mode: WriteMode,
    fail_after: Mutex<Option<usize>>,
    rows_written: AtomicUsize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_mode(WriteMode::Atomic)
    }

    pub fn with_mode(mode: WriteMode) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            mode,
            fail_after: Mutex::new(None),
            rows_written: AtomicUsize::new(0),
        }
    }

    /// The next batch fails after `n` operations (before any, for atomic mode).
    pub async fn fail_next_batch_after(&self, n: usize) {
        *self.fail_after.lock().await = Some(n);
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = UnifiedRecord>) {
        let mut rows = self.rows.lock().await;
        for record in records {
            rows.insert(record.identity(), record);
        }
    }

    /// Rows in ledger order.
    pub async fn records(&self) -> Vec<UnifiedRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// Total rows written by batches since construction.
    pub fn rows_written(&self) -> usize {
        self.rows_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerSink for MemoryLedger {
    fn describe(&self) -> String {
        format!("memory ({:?})", self.mode)
    }

    fn write_mode(&self) -> WriteMode {
        self.mode
    }

    async fn read_identities(&self, span: Option<DateWindow>) -> Result<HashMap<RecordIdentity, Fingerprint>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|(id, _)| in_span(id.date, span.as_ref()))
            .map(|(id, record)| (id.clone(), record.fingerprint()))
            .collect())
    }

    async fn apply_batch(&self, ops: &[LedgerOp]) -> Result<(), SinkWriteError> {
        let fail_after = self.fail_after.lock().await.take();
        let mut rows = self.rows.lock().await;

        if self.mode == WriteMode::Atomic {
            if fail_after.is_some() {
                return Err(SinkWriteError::nothing_written("injected failure", ops));
            }
            for op in ops {
                rows.insert(op.identity(), op.record().clone());
            }
            self.rows_written.fetch_add(ops.len(), Ordering::SeqCst);
            return Ok(());
        }

        for (i, op) in ops.iter().enumerate() {
            if fail_after == Some(i) {
                return Err(SinkWriteError {
                    reason: "injected failure".to_string(),
                    written: i,
                    unwritten: ops[i..].to_vec(),
                });
            }
            rows.insert(op.identity(), op.record().clone());
            self.rows_written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn verify_write_access(&self) -> Result<()> {
        let probe = probe_record();
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&probe.identity()) {
            return Err(anyhow!("probe identity {} is already present", probe.identity()));
        }
        rows.insert(probe.identity(), probe.clone());
        let read_back = rows.remove(&probe.identity());
        if read_back.as_ref() != Some(&probe) {
            return Err(anyhow!("probe row did not read back"));
        }
        Ok(())
    }
}
