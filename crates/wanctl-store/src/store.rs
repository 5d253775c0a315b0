//! Store open/write path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use wanctl_common::metrics::Granularity;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("metrics db error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("metrics db path {0} has no parent directory")]
    BadPath(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One sample to record.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub timestamp_seconds: i64,
    pub wan_name: String,
    pub metric_name: String,
    pub value: f64,
    /// JSON object, already serialized.
    pub labels: Option<String>,
    pub granularity: Granularity,
}

impl MetricSample {
    pub fn raw(
        timestamp_seconds: i64,
        wan_name: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
    ) -> Self {
        MetricSample {
            timestamp_seconds,
            wan_name: wan_name.into(),
            metric_name: metric_name.into(),
            value,
            labels: None,
            granularity: Granularity::Raw,
        }
    }

    pub fn with_labels(mut self, labels: Option<String>) -> Self {
        self.labels = labels;
        self
    }
}

/// One row as read back.
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub timestamp_seconds: i64,
    pub wan_name: String,
    pub metric_name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub granularity: String,
}

/// Handle to the metrics database. Cheap to clone.
#[derive(Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
    /// Serializes writers inside the process; SQLite is single-writer
    /// and contention shows up as SQLITE_BUSY otherwise.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

static INSTANCE: Mutex<Option<MetricsStore>> = Mutex::new(None);

impl MetricsStore {
    /// Open (creating schema if needed) with WAL + relaxed synchronous.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|_| StoreError::BadPath(db_path.to_path_buf()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = MetricsStore {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        store.create_schema().await?;
        Ok(store)
    }

    /// Open read-only; a missing file yields empty results, not an error.
    pub async fn open_readonly(db_path: &Path) -> Result<Option<Self>> {
        if !db_path.exists() {
            return Ok(None);
        }
        let options = SqliteConnectOptions::new().filename(db_path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Some(MetricsStore {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }))
    }

    /// Process-wide writer: opened on first use, shared afterwards.
    pub async fn shared(db_path: &Path) -> Result<MetricsStore> {
        if let Some(store) = INSTANCE.lock().unwrap().clone() {
            return Ok(store);
        }
        let store = MetricsStore::open(db_path).await?;
        let mut guard = INSTANCE.lock().unwrap();
        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }
        *guard = Some(store.clone());
        Ok(store)
    }

    /// Forget the singleton — test fixture isolation only.
    pub fn reset_instance() {
        INSTANCE.lock().unwrap().take();
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_seconds INTEGER NOT NULL,
                wan_name TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                labels TEXT,
                granularity TEXT NOT NULL DEFAULT 'raw'
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(timestamp_seconds)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_metrics_wan_metric_ts \
             ON metrics(wan_name, metric_name, timestamp_seconds)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_metrics_gran_ts \
             ON metrics(granularity, timestamp_seconds)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn write_metric(&self, sample: &MetricSample) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        insert(&self.pool, sample).await
    }

    /// Insert a batch in one transaction.
    pub async fn write_metrics_batch(&self, samples: &[MetricSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                "INSERT INTO metrics \
                 (timestamp_seconds, wan_name, metric_name, value, labels, granularity) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(sample.timestamp_seconds)
            .bind(&sample.wan_name)
            .bind(&sample.metric_name)
            .bind(sample.value)
            .bind(&sample.labels)
            .bind(sample.granularity.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete rows older than the retention horizon, in batches of
    /// 10 000 per transaction so the write lock never stalls a cycle.
    pub async fn apply_retention(&self, retention_days: u32, now_seconds: i64) -> Result<u64> {
        let cutoff = now_seconds - i64::from(retention_days) * 86_400;
        let mut total = 0u64;
        loop {
            let _guard = self.write_lock.lock().await;
            let result = sqlx::query(
                "DELETE FROM metrics WHERE id IN \
                 (SELECT id FROM metrics WHERE timestamp_seconds < ? LIMIT 10000)",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            let deleted = result.rows_affected();
            total += deleted;
            if deleted < 10_000 {
                break;
            }
        }
        if total > 0 {
            tracing::info!(deleted = total, retention_days, "metrics retention applied");
        }
        Ok(total)
    }

    /// Row count across all granularities (diagnostics + tests).
    pub async fn count_all(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM metrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert(pool: &SqlitePool, sample: &MetricSample) -> Result<()> {
    sqlx::query(
        "INSERT INTO metrics \
         (timestamp_seconds, wan_name, metric_name, value, labels, granularity) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(sample.timestamp_seconds)
    .bind(&sample.wan_name)
    .bind(&sample.metric_name)
    .bind(sample.value)
    .bind(&sample.labels)
    .bind(sample.granularity.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wanctl_common::metrics;

    async fn temp_store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let first = MetricsStore::open(&path).await.unwrap();
        first.close().await;
        // Re-opening over an existing file must not fail.
        let _second = MetricsStore::open(&path).await.unwrap();
    }

    #[tokio::test]
    async fn write_and_count() {
        let (_dir, store) = temp_store().await;
        store
            .write_metric(&MetricSample::raw(1000, "primary", metrics::RTT_MS, 25.0))
            .await
            .unwrap();
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_write_is_transactional() {
        let (_dir, store) = temp_store().await;
        let samples: Vec<MetricSample> = (0..50)
            .map(|i| MetricSample::raw(1000 + i, "primary", metrics::RTT_MS, 25.0))
            .collect();
        store.write_metrics_batch(&samples).await.unwrap();
        assert_eq!(store.count_all().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn retention_deletes_only_old_rows() {
        let (_dir, store) = temp_store().await;
        let now = 40 * 86_400;
        store
            .write_metrics_batch(&[
                MetricSample::raw(now - 35 * 86_400, "primary", metrics::RTT_MS, 20.0),
                MetricSample::raw(now - 5 * 86_400, "primary", metrics::RTT_MS, 21.0),
                MetricSample::raw(now, "primary", metrics::RTT_MS, 22.0),
            ])
            .await
            .unwrap();
        let deleted = store.apply_retention(30, now).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn readonly_missing_db_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = MetricsStore::open_readonly(&dir.path().join("absent.db"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn shared_returns_same_instance_until_reset() {
        MetricsStore::reset_instance();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let a = MetricsStore::shared(&path).await.unwrap();
        let b = MetricsStore::shared(&path).await.unwrap();
        // Same pool underneath.
        a.write_metric(&MetricSample::raw(1, "w", metrics::RTT_MS, 1.0))
            .await
            .unwrap();
        assert_eq!(b.count_all().await.unwrap(), 1);
        MetricsStore::reset_instance();
    }
}
