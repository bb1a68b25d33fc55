use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One observation of the account's cumulative counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub paid_bytes: i64,
    pub unpaid_bytes: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write sample: {0}")]
    Write(#[source] sqlx::Error),
    #[error("failed to read samples: {0}")]
    Read(#[source] sqlx::Error),
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    recorded_at: DateTime<Utc>,
    paid_bytes: i64,
    unpaid_bytes: i64,
}

impl From<SampleRow> for Sample {
    fn from(row: SampleRow) -> Self {
        Self {
            timestamp: row.recorded_at,
            paid_bytes: row.paid_bytes,
            unpaid_bytes: row.unpaid_bytes,
        }
    }
}

/// Append-only log of samples. Rows are never updated; `clear` is the only way to remove them.
#[derive(Clone)]
pub struct SeriesStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SeriesStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfer_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                paid_bytes INTEGER NOT NULL CHECK (paid_bytes >= 0),
                unpaid_bytes INTEGER NOT NULL CHECK (unpaid_bytes >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;
        Ok(())
    }

    pub async fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO transfer_samples (recorded_at, paid_bytes, unpaid_bytes)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(sample.timestamp)
        .bind(sample.paid_bytes)
        .bind(sample.unpaid_bytes)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;
        Ok(())
    }

    /// All samples in insertion order, oldest first. An empty store yields an empty vec.
    pub async fn read_all(&self) -> Result<Vec<Sample>, StoreError> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT recorded_at, paid_bytes, unpaid_bytes
            FROM transfer_samples
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Read)?;
        Ok(rows.into_iter().map(Sample::from).collect())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transfer_samples")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        Ok(count.max(0) as u64)
    }

    /// Irreversibly deletes every sample and reports how many rows were removed.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;
        let result = sqlx::query("DELETE FROM transfer_samples")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?;
        tx.commit().await.map_err(StoreError::Write)?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}
