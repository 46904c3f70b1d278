use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use hsync_adapters::DateWindow;
use hsync_core::{Cell, Fingerprint, RecordIdentity, UnifiedRecord, LEDGER_COLUMNS};
use hsync_storage::write_atomic;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{in_span, probe_record, LedgerSink};
use crate::merge::{LedgerOp, SinkWriteError, WriteMode};

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Text,
    Int,
    Float,
}

use ColumnKind::{Float, Int, Text};

/// Physical type of each ledger column, in `LEDGER_COLUMNS` order.
const COLUMN_KINDS: [ColumnKind; 23] = [
    Text, Text, Text, Text, Float, Int, Int, Int, Int, Int, Int, Int, Int, Text, Float, Int, Int, Int, Float, Float,
    Float, Int, Text,
];

const REQUIRED_COLUMNS: [&str; 3] = ["date", "source", "source_record_id"];

fn ledger_schema() -> Arc<Schema> {
    Arc::new(Schema::new(
        LEDGER_COLUMNS
            .iter()
            .zip(COLUMN_KINDS)
            .map(|(name, kind)| {
                let data_type = match kind {
                    Text => DataType::Utf8,
                    Int => DataType::Int64,
                    Float => DataType::Float64,
                };
                ArrowField::new(*name, data_type, !REQUIRED_COLUMNS.contains(name))
            })
            .collect::<Vec<_>>(),
    ))
}

fn encode(records: &[UnifiedRecord]) -> Result<Vec<u8>> {
    let rows: Vec<Vec<Cell>> = records.iter().map(UnifiedRecord::to_ledger_row).collect();
    let columns: Vec<ArrayRef> = COLUMN_KINDS
        .iter()
        .enumerate()
        .map(|(i, kind)| -> ArrayRef {
            match kind {
                Text => Arc::new(StringArray::from(rows.iter().map(|r| r[i].as_text()).collect::<Vec<_>>())),
                Int => Arc::new(Int64Array::from(rows.iter().map(|r| r[i].as_int()).collect::<Vec<_>>())),
                Float => Arc::new(Float64Array::from(rows.iter().map(|r| r[i].as_float()).collect::<Vec<_>>())),
            }
        })
        .collect();

    let batch = RecordBatch::try_new(ledger_schema(), columns).context("building ledger record batch")?;
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing ledger record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn column_cells(batch: &RecordBatch, index: usize, rows: &mut [Vec<Cell>]) -> Result<()> {
    let name = LEDGER_COLUMNS[index];
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("ledger file lacks column `{name}`"))?;
    let wrong_type = || anyhow!("ledger column `{name}` has type {}", column.data_type());

    match COLUMN_KINDS[index] {
        Text => {
            let values = column.as_any().downcast_ref::<StringArray>().ok_or_else(wrong_type)?;
            for (r, row) in rows.iter_mut().enumerate() {
                row.push(if values.is_null(r) { Cell::Null } else { Cell::Text(values.value(r).to_string()) });
            }
        }
        Int => {
            let values = column.as_any().downcast_ref::<Int64Array>().ok_or_else(wrong_type)?;
            for (r, row) in rows.iter_mut().enumerate() {
                row.push(if values.is_null(r) { Cell::Null } else { Cell::Int(values.value(r)) });
            }
        }
        Float => {
            let values = column.as_any().downcast_ref::<Float64Array>().ok_or_else(wrong_type)?;
            for (r, row) in rows.iter_mut().enumerate() {
                row.push(if values.is_null(r) { Cell::Null } else { Cell::Float(values.value(r)) });
            }
        }
    }
    Ok(())
}

fn decode(path: &Path) -> Result<Vec<UnifiedRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch from {}", path.display()))?;
        let mut rows = vec![Vec::with_capacity(LEDGER_COLUMNS.len()); batch.num_rows()];
        for index in 0..LEDGER_COLUMNS.len() {
            column_cells(&batch, index, &mut rows)?;
        }
        for row in rows {
            records.push(UnifiedRecord::from_ledger_row(&row).with_context(|| format!("decoding {}", path.display()))?);
        }
    }
    Ok(records)
}

/// The whole ledger as one parquet file with the 23 contract columns.
/// Batches rewrite the file through a temp file and rename.
#[derive(Debug)]
pub struct ParquetLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ParquetLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every row, in ledger order. A missing file is an empty ledger.
    pub async fn read_all(&self) -> Result<Vec<UnifiedRecord>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        decode(&self.path)
    }

    async fn write_merged(&self, ops: &[LedgerOp]) -> Result<usize> {
        let mut rows: BTreeMap<RecordIdentity, UnifiedRecord> =
            self.read_all().await?.into_iter().map(|r| (r.identity(), r)).collect();
        for op in ops {
            rows.insert(op.identity(), op.record().clone());
        }
        let records: Vec<UnifiedRecord> = rows.into_values().collect();
        let bytes = encode(&records)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(records.len())
    }
}

#[async_trait]
impl LedgerSink for ParquetLedger {
    fn describe(&self) -> String {
        format!("parquet {}", self.path.display())
    }

    fn write_mode(&self) -> WriteMode {
        WriteMode::Atomic
    }

    async fn read_identities(&self, span: Option<DateWindow>) -> Result<HashMap<RecordIdentity, Fingerprint>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| in_span(r.date, span.as_ref()))
            .map(|r| (r.identity(), r.fingerprint()))
            .collect())
    }

    async fn apply_batch(&self, ops: &[LedgerOp]) -> Result<(), SinkWriteError> {
        let _guard = self.write_lock.lock().await;
        match self.write_merged(ops).await {
            Ok(total) => {
                debug!(path = %self.path.display(), ops = ops.len(), total, "parquet ledger rewritten");
                Ok(())
            }
            Err(err) => Err(SinkWriteError::nothing_written(format!("{err:#}"), ops)),
        }
    }

    async fn verify_write_access(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            decode(&self.path)?;
        }
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let probe_path = parent.join(format!(".verify-{}.parquet", Uuid::new_v4()));
        let probe = probe_record();

        write_atomic(&probe_path, &encode(std::slice::from_ref(&probe))?).await?;
        let read_back = decode(&probe_path);
        tokio::fs::remove_file(&probe_path)
            .await
            .with_context(|| format!("removing {}", probe_path.display()))?;

        match read_back?.as_slice() {
            [row] if *row == probe => Ok(()),
            other => Err(anyhow!("probe file read back {} rows", other.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate};
    use hsync_core::{Source, Workout};

    fn record(day: u32, id: &str) -> UnifiedRecord {
        UnifiedRecord {
            bedtime: Some(DateTime::parse_from_rfc3339("2025-01-01T23:05:00-05:00").unwrap()),
            sleep_duration_min: Some(452.0),
            sleep_score: Some(81),
            workout: Some(Workout {
                distance_km: Some(4.99),
                pace_min_per_km: Some(4.97),
                ..Workout::of_type("run")
            }),
            ..UnifiedRecord::new(NaiveDate::from_ymd_opt(2025, 1, day).unwrap(), Source::RollaOne, id)
        }
    }

    #[test]
    fn schema_follows_column_contract() {
        let schema = ledger_schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, LEDGER_COLUMNS);
        assert_eq!(schema.field(4).data_type(), &DataType::Float64);
        assert_eq!(schema.field(5).data_type(), &DataType::Int64);
        assert!(!schema.field(22).is_nullable());
    }

    #[tokio::test]
    async fn batches_upsert_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ParquetLedger::new(dir.path().join("ledger").join("unified.parquet"));
        assert!(ledger.read_all().await.unwrap().is_empty());

        ledger
            .apply_batch(&[LedgerOp::Insert(record(2, "b")), LedgerOp::Insert(record(1, "a"))])
            .await
            .unwrap();
        let mut corrected = record(1, "a");
        corrected.sleep_score = Some(84);
        ledger.apply_batch(&[LedgerOp::Update(corrected.clone())]).await.unwrap();

        let rows = ledger.read_all().await.unwrap();
        assert_eq!(rows, vec![corrected.clone(), record(2, "b")]);
        let ids = ledger.read_identities(None).await.unwrap();
        assert_eq!(ids[&corrected.identity()], corrected.fingerprint());
    }

    #[tokio::test]
    async fn probe_round_trip_leaves_directory_clean() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ParquetLedger::new(dir.path().join("unified.parquet"));
        ledger.verify_write_access().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unreadable_file_fails_the_batch_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unified.parquet");
        std::fs::write(&path, b"not parquet").unwrap();
        let ledger = ParquetLedger::new(&path);
        let ops = vec![LedgerOp::Insert(record(1, "a"))];
        let err = ledger.apply_batch(&ops).await.unwrap_err();
        assert_eq!(err.unwritten, ops);
        assert_eq!(std::fs::read(&path).unwrap(), b"not parquet");
    }
}
