//! Append-only availability observations, one SQLite file per calendar month.

use std::path::{Path, PathBuf};

use park_core::{format_timestamp, now_local, AvailabilityObservation, PartitionId, Timestamp};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::fs;
use tracing::{debug, warn};

use crate::{open_sqlite, StoreError};

const CREATE_AVAILABILITY: &str = r#"
CREATE TABLE IF NOT EXISTS availability (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parking_id TEXT NOT NULL,
    available_car INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
)
"#;

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_availability_parking_id ON availability(parking_id)",
    "CREATE INDEX IF NOT EXISTS idx_availability_recorded_at ON availability(recorded_at)",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub partition: PartitionId,
    pub file_name: String,
    pub exists: bool,
    pub total: i64,
    pub unique_entities: i64,
    pub first_ts: Option<String>,
    pub last_ts: Option<String>,
}

impl PartitionStats {
    fn absent(partition: PartitionId) -> Self {
        Self {
            partition,
            file_name: partition.file_name(),
            exists: false,
            total: 0,
            unique_entities: 0,
            first_ts: None,
            last_ts: None,
        }
    }
}

/// Open handle on one monthly partition.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    path: PathBuf,
    pool: SqlitePool,
}

impl Partition {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every observation in one transaction, all stamped with `recorded_at`.
    pub async fn append(
        &self,
        observations: &[AvailabilityObservation],
        recorded_at: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for observation in observations {
            let inserted = sqlx::query(
                "INSERT INTO availability (parking_id, available_car, recorded_at) VALUES (?, ?, ?)",
            )
            .bind(&observation.parking_id)
            .bind(observation.available_car)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(result) => written += result.rows_affected(),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(partition = %self.id, error = %rollback_err, "rollback failed");
                    }
                    return Err(err.into());
                }
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    dir: PathBuf,
}

impl TimeSeriesStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, id: PartitionId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    /// Open the partition covering `now`, creating file, table and indexes on first use.
    pub async fn partition_for(&self, now: &Timestamp) -> Result<Partition, StoreError> {
        self.open_partition(PartitionId::for_time(now)).await
    }

    pub async fn open_partition(&self, id: PartitionId) -> Result<Partition, StoreError> {
        let path = self.partition_path(id);
        let pool = open_sqlite(&path, true).await?;
        sqlx::query(CREATE_AVAILABILITY).execute(&pool).await?;
        for index_sql in CREATE_INDEXES {
            sqlx::query(index_sql).execute(&pool).await?;
        }
        debug!(partition = %id, path = %path.display(), "availability partition ready");
        Ok(Partition { id, path, pool })
    }

    pub async fn append_batch(
        &self,
        observations: &[AvailabilityObservation],
    ) -> Result<u64, StoreError> {
        self.append_batch_at(observations, now_local()).await
    }

    /// Route the batch to the partition of `now` and stamp every row with it.
    /// An empty batch leaves the disk untouched.
    pub async fn append_batch_at(
        &self,
        observations: &[AvailabilityObservation],
        now: Timestamp,
    ) -> Result<u64, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let partition = self.partition_for(&now).await?;
        let written = partition
            .append(observations, &format_timestamp(&now))
            .await;
        partition.close().await;
        written
    }

    /// Summary of one month. Missing partitions report `exists = false`.
    pub async fn stats(&self, id: PartitionId) -> Result<PartitionStats, StoreError> {
        let path = self.partition_path(id);
        if !fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })? {
            return Ok(PartitionStats::absent(id));
        }

        let pool = open_sqlite(&path, false).await?;
        let stats = partition_stats(&pool, id).await;
        pool.close().await;
        stats
    }

    /// Partitions present on disk, oldest first.
    pub async fn list_partitions(&self) -> Result<Vec<PartitionId>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        if !fs::try_exists(&self.dir).await.map_err(io_err)? {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(PartitionId::parse_file_name)
            {
                partitions.push(id);
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

async fn partition_stats(pool: &SqlitePool, id: PartitionId) -> Result<PartitionStats, StoreError> {
    let has_table: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'availability'",
    )
    .fetch_one(pool)
    .await?;
    if has_table == 0 {
        return Ok(PartitionStats::absent(id));
    }

    let row = sqlx::query(
        "SELECT COUNT(*) AS total, COUNT(DISTINCT parking_id) AS unique_entities, \
         MIN(recorded_at) AS first_ts, MAX(recorded_at) AS last_ts FROM availability",
    )
    .fetch_one(pool)
    .await?;

    Ok(PartitionStats {
        partition: id,
        file_name: id.file_name(),
        exists: true,
        total: row.try_get("total")?,
        unique_entities: row.try_get("unique_entities")?,
        first_ts: row.try_get("first_ts")?,
        last_ts: row.try_get("last_ts")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use tempfile::tempdir;

    fn at(month: u32, day: u32, hour: u32) -> Timestamp {
        FixedOffset::east_opt(8 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, month, day, hour, 0, 0)
            .single()
            .expect("ts")
    }

    fn obs(id: &str, available: i64) -> AvailabilityObservation {
        AvailabilityObservation {
            parking_id: id.to_string(),
            available_car: available,
        }
    }

    #[tokio::test]
    async fn stats_for_unwritten_month_report_absent() {
        let dir = tempdir().expect("tempdir");
        let store = TimeSeriesStore::new(dir.path().join("availability"));
        let id = PartitionId::new(2026, 3).expect("month");

        let stats = store.stats(id).await.expect("stats");
        assert!(!stats.exists);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.unique_entities, 0);
        assert_eq!(stats.file_name, "availability_202603.db");
        assert!(store.list_partitions().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn batch_rows_share_one_recorded_at() {
        let dir = tempdir().expect("tempdir");
        let store = TimeSeriesStore::new(dir.path());
        let now = at(2, 4, 10);

        let written = store
            .append_batch_at(&[obs("A", 12), obs("B", 0), obs("A", 11)], now)
            .await
            .expect("append");
        assert_eq!(written, 3);

        let stats = store
            .stats(PartitionId::for_time(&now))
            .await
            .expect("stats");
        assert!(stats.exists);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unique_entities, 2);
        assert_eq!(stats.first_ts.as_deref(), Some("2026-02-04T10:00:00.000000+08:00"));
        assert_eq!(stats.first_ts, stats.last_ts);
    }

    #[tokio::test]
    async fn batches_in_different_months_land_in_different_partitions() {
        let dir = tempdir().expect("tempdir");
        let store = TimeSeriesStore::new(dir.path());

        store.append_batch_at(&[obs("A", 5)], at(2, 28, 23)).await.expect("feb");
        store.append_batch_at(&[obs("A", 6)], at(3, 1, 0)).await.expect("mar");
        store.append_batch_at(&[obs("B", 7)], at(1, 15, 12)).await.expect("jan");

        let partitions = store.list_partitions().await.expect("list");
        assert_eq!(
            partitions,
            vec![
                PartitionId::new(2026, 1).expect("jan"),
                PartitionId::new(2026, 2).expect("feb"),
                PartitionId::new(2026, 3).expect("mar"),
            ]
        );
        for id in partitions {
            assert_eq!(store.stats(id).await.expect("stats").total, 1);
        }
    }

    #[tokio::test]
    async fn empty_batch_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = TimeSeriesStore::new(dir.path().join("availability"));

        assert_eq!(store.append_batch(&[]).await.expect("append"), 0);
        assert!(!dir.path().join("availability").exists());
    }

    #[tokio::test]
    async fn unrelated_files_are_not_listed() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");
        std::fs::write(dir.path().join("availability_2026.db"), b"").expect("write");
        let store = TimeSeriesStore::new(dir.path());
        store.append_batch_at(&[obs("A", 1)], at(2, 1, 0)).await.expect("append");

        assert_eq!(
            store.list_partitions().await.expect("list"),
            vec![PartitionId::new(2026, 2).expect("feb")]
        );
    }
}
