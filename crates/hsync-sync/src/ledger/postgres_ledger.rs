use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use hsync_adapters::DateWindow;
use hsync_core::{timestamp_text, Fingerprint, RecordIdentity, Source, UnifiedRecord, LEDGER_COLUMNS};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;

use super::{probe_record, LedgerSink};
use crate::merge::{LedgerOp, SinkWriteError, WriteMode};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS unified_ledger (
    date                            DATE NOT NULL,
    source                          TEXT NOT NULL,
    bedtime                         TEXT,
    wake_time                       TEXT,
    sleep_duration_min              DOUBLE PRECISION,
    sleep_score                     BIGINT,
    rhr_bpm                         BIGINT,
    hrv_ms                          BIGINT,
    readiness_or_body_battery_score BIGINT,
    health_score                    BIGINT,
    steps                           BIGINT,
    active_calories                 BIGINT,
    activity_score                  BIGINT,
    workout_type                    TEXT,
    workout_duration_min            DOUBLE PRECISION,
    workout_active_calories         BIGINT,
    workout_avg_hr_bpm              BIGINT,
    workout_max_hr_bpm              BIGINT,
    distance_km                     DOUBLE PRECISION,
    pace_min_per_km                 DOUBLE PRECISION,
    avg_speed_kmh                   DOUBLE PRECISION,
    workout_or_strain_score         BIGINT,
    source_record_id                TEXT NOT NULL,
    fingerprint                     TEXT NOT NULL,
    written_at                      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (date, source, source_record_id)
)
"#;

/// Tables created before bedtime/wake_time kept their offset hold them as
/// TIMESTAMPTZ; those are rewritten as UTC RFC 3339 text.
const TEXT_TIMESTAMPS_SQL: &str = r#"
DO $$
BEGIN
    IF EXISTS (
        SELECT 1 FROM information_schema.columns
         WHERE table_name = 'unified_ledger'
           AND column_name = 'bedtime'
           AND data_type = 'timestamp with time zone'
    ) THEN
        ALTER TABLE unified_ledger
            ALTER COLUMN bedtime TYPE TEXT
                USING to_char(bedtime AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS"+00:00"'),
            ALTER COLUMN wake_time TYPE TEXT
                USING to_char(wake_time AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS"+00:00"');
    END IF;
END
$$
"#;

const KEY_COLUMNS: [&str; 3] = ["date", "source", "source_record_id"];

/// `INSERT … ON CONFLICT DO UPDATE` over the contract columns plus the fingerprint.
fn upsert_sql() -> String {
    let columns = LEDGER_COLUMNS.join(", ");
    let placeholders = (1..=LEDGER_COLUMNS.len() + 1)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = LEDGER_COLUMNS
        .iter()
        .filter(|c| !KEY_COLUMNS.contains(*c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .chain(["fingerprint = EXCLUDED.fingerprint".to_string(), "written_at = NOW()".to_string()])
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO unified_ledger ({columns}, fingerprint) VALUES ({placeholders}) \
         ON CONFLICT (date, source, source_record_id) DO UPDATE SET {updates}"
    )
}

fn bind_record<'q>(query: Query<'q, Postgres, PgArguments>, r: &UnifiedRecord) -> Query<'q, Postgres, PgArguments> {
    let w = r.workout.as_ref();
    query
        .bind(r.date)
        .bind(r.source.as_str())
        .bind(r.bedtime.as_ref().map(timestamp_text))
        .bind(r.wake_time.as_ref().map(timestamp_text))
        .bind(r.sleep_duration_min)
        .bind(r.sleep_score)
        .bind(r.rhr_bpm)
        .bind(r.hrv_ms)
        .bind(r.readiness_or_body_battery_score)
        .bind(r.health_score)
        .bind(r.steps)
        .bind(r.active_calories)
        .bind(r.activity_score)
        .bind(w.map(|w| w.workout_type.clone()))
        .bind(w.and_then(|w| w.duration_min))
        .bind(w.and_then(|w| w.active_calories))
        .bind(w.and_then(|w| w.avg_hr_bpm))
        .bind(w.and_then(|w| w.max_hr_bpm))
        .bind(w.and_then(|w| w.distance_km))
        .bind(w.and_then(|w| w.pace_min_per_km))
        .bind(w.and_then(|w| w.avg_speed_kmh))
        .bind(w.and_then(|w| w.strain_score))
        .bind(r.source_record_id.clone())
        .bind(r.fingerprint().0)
}

/// Ledger table `unified_ledger` in Postgres. Each batch is one transaction.
///
/// The stored fingerprint is the one computed at write time, so change
/// detection does not depend on how Postgres renders timestamps.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to the ledger database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the ledger table if it is missing. Safe to run repeatedly.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("creating table unified_ledger")?;
        sqlx::raw_sql(TEXT_TIMESTAMPS_SQL)
            .execute(&self.pool)
            .await
            .context("converting bedtime/wake_time to text")?;
        info!("ledger schema ensured");
        Ok(())
    }

    async fn write_all(&self, ops: &[LedgerOp]) -> Result<(), sqlx::Error> {
        let sql = upsert_sql();
        let mut tx = self.pool.begin().await?;
        for op in ops {
            bind_record(sqlx::query(&sql), op.record()).execute(&mut *tx).await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl LedgerSink for PostgresLedger {
    fn describe(&self) -> String {
        "postgres table unified_ledger".to_string()
    }

    fn write_mode(&self) -> WriteMode {
        WriteMode::Atomic
    }

    async fn read_identities(&self, span: Option<DateWindow>) -> Result<HashMap<RecordIdentity, Fingerprint>> {
        let rows = sqlx::query(
            r#"
            SELECT date, source, source_record_id, fingerprint
              FROM unified_ledger
             WHERE ($1::date IS NULL OR date >= $1)
               AND ($2::date IS NULL OR date <= $2)
            "#,
        )
        .bind(span.map(|w| w.start))
        .bind(span.map(|w| w.end))
        .fetch_all(&self.pool)
        .await
        .context("reading ledger identities")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let date: NaiveDate = row.try_get("date")?;
            let source: String = row.try_get("source")?;
            let source = source
                .parse::<Source>()
                .map_err(|err| anyhow!("ledger row holds {err}"))?;
            let identity = RecordIdentity {
                date,
                source,
                source_record_id: row.try_get("source_record_id")?,
            };
            out.insert(identity, Fingerprint(row.try_get("fingerprint")?));
        }
        Ok(out)
    }

    async fn apply_batch(&self, ops: &[LedgerOp]) -> Result<(), SinkWriteError> {
        self.write_all(ops)
            .await
            .map_err(|err| SinkWriteError::nothing_written(format!("postgres batch rolled back: {err}"), ops))
    }

    async fn verify_write_access(&self) -> Result<()> {
        let probe = probe_record();
        let sql = upsert_sql();
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        bind_record(sqlx::query(&sql), &probe)
            .execute(&mut *tx)
            .await
            .context("inserting probe row (has `hsync migrate` run?)")?;
        let found: i64 = sqlx::query("SELECT COUNT(*) FROM unified_ledger WHERE source_record_id = $1")
            .bind(&probe.source_record_id)
            .fetch_one(&mut *tx)
            .await
            .context("reading probe row back")?
            .try_get(0)?;
        tx.rollback().await.context("rolling back probe row")?;
        if found != 1 {
            return Err(anyhow!("probe row read back {found} times"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_touches_every_contract_column() {
        let sql = upsert_sql();
        assert!(sql.starts_with("INSERT INTO unified_ledger (date, source, bedtime,"));
        assert!(sql.contains("source_record_id, fingerprint) VALUES ($1,"));
        assert!(sql.contains("$24)"));
        assert!(sql.contains("workout_or_strain_score = EXCLUDED.workout_or_strain_score"));
        assert!(!sql.contains("date = EXCLUDED.date"));
        assert!(!sql.contains("source_record_id = EXCLUDED"));
    }

    #[test]
    fn sleep_timestamps_are_stored_with_their_offset() {
        assert!(SCHEMA_SQL.contains("    bedtime                         TEXT,"));
        assert!(SCHEMA_SQL.contains("    wake_time                       TEXT,"));
        assert!(!SCHEMA_SQL.contains("bedtime                         TIMESTAMPTZ"));
        assert!(TEXT_TIMESTAMPS_SQL.contains("data_type = 'timestamp with time zone'"));

        let mut record = UnifiedRecord::new(NaiveDate::default(), Source::Oura, "evening");
        record.bedtime = Some(chrono::DateTime::parse_from_rfc3339("2025-01-01T23:05:00-05:00").unwrap());
        assert_eq!(record.bedtime.as_ref().map(timestamp_text).as_deref(), Some("2025-01-01T23:05:00-05:00"));
        let row = record.to_ledger_row();
        assert_eq!(row[2], hsync_core::Cell::Text("2025-01-01T23:05:00-05:00".into()));
    }

    #[test]
    fn schema_declares_the_identity_key() {
        assert!(SCHEMA_SQL.contains("PRIMARY KEY (date, source, source_record_id)"));
        for column in LEDGER_COLUMNS {
            assert!(SCHEMA_SQL.contains(&format!("    {column} ")), "{column}");
        }
    }
}
