use async_trait::async_trait;
use common::SagaId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::log::validate_for_append;
use crate::{RecordId, Result, SagaLog, SagaLogError, SagaLogRecord, Sequence};

/// PostgreSQL-backed saga log.
#[derive(Clone)]
pub struct PostgresSagaLog {
    pool: PgPool,
}

impl PostgresSagaLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and runs the migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let log = Self::new(pool);
        log.run_migrations().await?;
        Ok(log)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<SagaLogRecord> {
        let step_index: Option<i64> = row.try_get("step_index")?;
        Ok(SagaLogRecord {
            record_id: RecordId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            sequence: Sequence::new(row.try_get("sequence")?),
            step_index: step_index.map(|i| i as usize),
            status: row.try_get("status")?,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl SagaLog for PostgresSagaLog {
    async fn append(&self, record: SagaLogRecord, expected: Sequence) -> Result<Sequence> {
        validate_for_append(&record, expected)?;
        let saga_id = record.saga_id;

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM saga_log WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let actual = Sequence::new(current.unwrap_or(0));
        if actual != expected {
            return Err(SagaLogError::SequenceConflict {
                saga_id,
                expected,
                actual,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO saga_log (id, saga_id, sequence, step_index, status, timestamp, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.record_id.as_uuid())
        .bind(saga_id.as_uuid())
        .bind(record.sequence.as_i64())
        .bind(record.step_index.map(|i| i as i64))
        .bind(&record.status)
        .bind(record.timestamp)
        .bind(&record.payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // A concurrent writer took the same sequence between our read and insert.
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_saga_sequence")
            {
                return SagaLogError::SequenceConflict {
                    saga_id,
                    expected,
                    actual: record.sequence,
                };
            }
            SagaLogError::Database(e)
        })?;

        tx.commit().await?;
        tracing::trace!(%saga_id, sequence = %record.sequence, status = %record.status, "saga log record appended");
        Ok(record.sequence)
    }

    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<SagaLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, sequence, step_index, status, timestamp, payload
            FROM saga_log
            WHERE saga_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn saga_ids(&self) -> Result<Vec<SagaId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT saga_id
            FROM saga_log
            GROUP BY saga_id
            ORDER BY MIN(timestamp) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }

    async fn saga_ids_with_status(&self, status: &str) -> Result<Vec<SagaId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT saga_id
            FROM saga_log
            WHERE status = $1
            GROUP BY saga_id
            ORDER BY MIN(timestamp) ASC
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }

    async fn saga_ids_without_status(&self, status: &str) -> Result<Vec<SagaId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT s.saga_id
            FROM saga_log s
            WHERE s.sequence = 1
              AND NOT EXISTS (
                  SELECT 1 FROM saga_log p
                  WHERE p.saga_id = s.saga_id AND p.status = $1
              )
            ORDER BY s.timestamp ASC
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }

    async fn current_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>> {
        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM saga_log WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(current.map(Sequence::new))
    }
}
