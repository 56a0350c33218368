//! Durable parking-lot registry with soft-delete tombstones.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use park_core::{
    format_timestamp, now_local, parse_timestamp, Lifecycle, ParkingLotRecord, StoredParkingLot,
    Timestamp,
};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};

use crate::{open_sqlite, StoreError};

const CREATE_PARKING_LOTS: &str = r#"
CREATE TABLE IF NOT EXISTS parking_lots (
    id TEXT PRIMARY KEY,
    area TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    type TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    address TEXT NOT NULL DEFAULT '',
    tel TEXT NOT NULL DEFAULT '',
    pay_ex TEXT NOT NULL DEFAULT '',
    service_time TEXT NOT NULL DEFAULT '',
    tw97x REAL,
    tw97y REAL,
    total_car INTEGER NOT NULL DEFAULT 0,
    total_motor INTEGER NOT NULL DEFAULT 0,
    total_bike INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT DEFAULT NULL
)
"#;

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_parking_lots_area ON parking_lots(area)",
    "CREATE INDEX IF NOT EXISTS idx_parking_lots_deleted_at ON parking_lots(deleted_at)",
];

const CREATE_SYNC_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    job TEXT PRIMARY KEY,
    snapshot_hash TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryStats {
    pub total: i64,
    pub active: i64,
    pub deleted: i64,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl RegistryStore {
    /// Open (creating if needed) the registry database and ensure its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let pool = open_sqlite(&path, true).await?;
        let store = Self { pool, path };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open a registry that must already exist, without touching its schema.
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let pool = open_sqlite(&path, false).await?;
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_PARKING_LOTS).execute(&self.pool).await?;
        for index_sql in CREATE_INDEXES {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }
        sqlx::query(CREATE_SYNC_STATE).execute(&self.pool).await?;
        debug!(path = %self.path.display(), "registry schema ready");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn upsert(&self, record: &ParkingLotRecord) -> Result<(String, bool), StoreError> {
        self.upsert_at(record, now_local()).await
    }

    /// Insert an unseen id, otherwise overwrite its attributes and clear any tombstone.
    /// Returns the id and whether the row was newly created.
    pub async fn upsert_at(
        &self,
        record: &ParkingLotRecord,
        now: Timestamp,
    ) -> Result<(String, bool), StoreError> {
        let now = format_timestamp(&now);
        let mut tx = self.pool.begin().await?;
        match upsert_in_tx(&mut tx, record, &now).await {
            Ok(was_new) => {
                tx.commit().await?;
                Ok((record.id.clone(), was_new))
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(parking_id = %record.id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn mark_deleted(&self, ids: &BTreeSet<String>) -> Result<u64, StoreError> {
        self.mark_deleted_at(ids, now_local()).await
    }

    /// Tombstone every listed id that is still active. Already tombstoned rows keep
    /// their original `deleted_at`. Each id is its own write.
    pub async fn mark_deleted_at(
        &self,
        ids: &BTreeSet<String>,
        now: Timestamp,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = format_timestamp(&now);
        let mut count = 0u64;
        for id in ids {
            let result = sqlx::query(
                "UPDATE parking_lots SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            count += result.rows_affected();
        }
        Ok(count)
    }

    pub async fn active_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM parking_lots WHERE deleted_at IS NULL")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredParkingLot>, StoreError> {
        let row = sqlx::query("SELECT * FROM parking_lots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| stored_from_row(&row)).transpose()
    }

    pub async fn stats(&self) -> Result<RegistryStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0) AS active \
             FROM parking_lots",
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let active: i64 = row.try_get("active")?;
        Ok(RegistryStats {
            total,
            active,
            deleted: total - active,
        })
    }

    pub async fn last_snapshot_hash(&self, job: &str) -> Result<Option<String>, StoreError> {
        let hash = sqlx::query_scalar("SELECT snapshot_hash FROM sync_state WHERE job = ?")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    pub async fn record_snapshot_hash(&self, job: &str, hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (job, snapshot_hash, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(job) DO UPDATE SET \
             snapshot_hash = excluded.snapshot_hash, updated_at = excluded.updated_at",
        )
        .bind(job)
        .bind(hash)
        .bind(format_timestamp(&now_local()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn upsert_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ParkingLotRecord,
    now: &str,
) -> Result<bool, StoreError> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parking_lots WHERE id = ?")
        .bind(&record.id)
        .fetch_one(&mut **tx)
        .await?;

    if existing == 0 {
        sqlx::query(
            r#"
            INSERT INTO parking_lots (
                id, area, name, type, summary, address, tel,
                pay_ex, service_time, tw97x, tw97y,
                total_car, total_motor, total_bike,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.area)
        .bind(&record.name)
        .bind(&record.lot_type)
        .bind(&record.summary)
        .bind(&record.address)
        .bind(&record.tel)
        .bind(&record.pay_ex)
        .bind(&record.service_time)
        .bind(record.tw97x)
        .bind(record.tw97y)
        .bind(record.total_car)
        .bind(record.total_motor)
        .bind(record.total_bike)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }

    sqlx::query(
        r#"
        UPDATE parking_lots SET
            area = ?, name = ?, type = ?, summary = ?, address = ?, tel = ?,
            pay_ex = ?, service_time = ?, tw97x = ?, tw97y = ?,
            total_car = ?, total_motor = ?, total_bike = ?,
            updated_at = ?, deleted_at = NULL
        WHERE id = ?
        "#,
    )
    .bind(&record.area)
    .bind(&record.name)
    .bind(&record.lot_type)
    .bind(&record.summary)
    .bind(&record.address)
    .bind(&record.tel)
    .bind(&record.pay_ex)
    .bind(&record.service_time)
    .bind(record.tw97x)
    .bind(record.tw97y)
    .bind(record.total_car)
    .bind(record.total_motor)
    .bind(record.total_bike)
    .bind(now)
    .bind(&record.id)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredParkingLot, StoreError> {
    let record = ParkingLotRecord {
        id: row.try_get("id")?,
        area: row.try_get("area")?,
        name: row.try_get("name")?,
        lot_type: row.try_get("type")?,
        summary: row.try_get("summary")?,
        address: row.try_get("address")?,
        tel: row.try_get("tel")?,
        pay_ex: row.try_get("pay_ex")?,
        service_time: row.try_get("service_time")?,
        tw97x: row.try_get("tw97x")?,
        tw97y: row.try_get("tw97y")?,
        total_car: row.try_get("total_car")?,
        total_motor: row.try_get("total_motor")?,
        total_bike: row.try_get("total_bike")?,
    };
    let created_at = timestamp_column(row, "created_at")?;
    let updated_at = timestamp_column(row, "updated_at")?;
    let deleted_at: Option<String> = row.try_get("deleted_at")?;
    let deleted_at = deleted_at
        .map(|value| {
            parse_timestamp(&value).map_err(|source| StoreError::Timestamp {
                column: "deleted_at",
                value,
                source,
            })
        })
        .transpose()?;

    Ok(StoredParkingLot {
        record,
        created_at,
        updated_at,
        lifecycle: Lifecycle::from_deleted_at(deleted_at),
    })
}

fn timestamp_column(row: &SqliteRow, column: &'static str) -> Result<Timestamp, StoreError> {
    let value: String = row.try_get(column)?;
    parse_timestamp(&value).map_err(|source| StoreError::Timestamp {
        column,
        value,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset, TimeZone};
    use tempfile::tempdir;

    fn at(hour: u32) -> Timestamp {
        FixedOffset::east_opt(8 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, 2, 4, hour, 0, 0)
            .single()
            .expect("ts")
    }

    fn lot(id: &str, name: &str) -> ParkingLotRecord {
        ParkingLotRecord {
            id: id.to_string(),
            area: "板橋區".to_string(),
            name: name.to_string(),
            total_car: 120,
            tw97x: Some(296_845.2),
            tw97y: None,
            ..Default::default()
        }
    }

    async fn open_store(dir: &Path) -> RegistryStore {
        RegistryStore::open(dir.join("db").join("parking.db"))
            .await
            .expect("open registry")
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_keeping_created_at() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let (id, was_new) = store.upsert_at(&lot("A", "first"), at(1)).await.expect("insert");
        assert_eq!(id, "A");
        assert!(was_new);

        let (_, was_new) = store.upsert_at(&lot("A", "renamed"), at(2)).await.expect("update");
        assert!(!was_new);

        let stored = store.get("A").await.expect("get").expect("row exists");
        assert_eq!(stored.record.name, "renamed");
        assert_eq!(stored.record.tw97x, Some(296_845.2));
        assert_eq!(stored.record.tw97y, None);
        assert_eq!(stored.created_at, at(1));
        assert_eq!(stored.updated_at, at(2));
        assert_eq!(stored.lifecycle, Lifecycle::Active);
    }

    #[tokio::test]
    async fn mark_deleted_preserves_first_tombstone_time() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store.upsert_at(&lot("A", "a"), at(1)).await.expect("insert");

        let ids = BTreeSet::from(["A".to_string(), "missing".to_string()]);
        assert_eq!(store.mark_deleted_at(&ids, at(2)).await.expect("mark"), 1);
        assert_eq!(store.mark_deleted_at(&ids, at(3)).await.expect("re-mark"), 0);

        let stored = store.get("A").await.expect("get").expect("row kept");
        assert_eq!(stored.lifecycle, Lifecycle::Deleted { at: at(2) });
        assert!(store.active_ids().await.expect("active").is_empty());
    }

    #[tokio::test]
    async fn reappearing_lot_is_reactivated() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store.upsert_at(&lot("A", "a"), at(1)).await.expect("insert");
        store
            .mark_deleted_at(&BTreeSet::from(["A".to_string()]), at(2))
            .await
            .expect("mark");

        let later = at(3) + Duration::minutes(5);
        let (_, was_new) = store.upsert_at(&lot("A", "a"), later).await.expect("revive");
        assert!(!was_new);

        let stored = store.get("A").await.expect("get").expect("row");
        assert!(stored.lifecycle.is_active());
        assert_eq!(stored.created_at, at(1));
        assert_eq!(stored.updated_at, later);
    }

    #[tokio::test]
    async fn stats_count_active_and_tombstoned_rows() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        assert_eq!(store.stats().await.expect("stats"), RegistryStats::default());

        for id in ["A", "B", "C"] {
            store.upsert(&lot(id, id)).await.expect("insert");
        }
        store
            .mark_deleted(&BTreeSet::from(["B".to_string()]))
            .await
            .expect("mark");

        assert_eq!(
            store.stats().await.expect("stats"),
            RegistryStats {
                total: 3,
                active: 2,
                deleted: 1
            }
        );
        assert_eq!(
            store.active_ids().await.expect("active"),
            BTreeSet::from(["A".to_string(), "C".to_string()])
        );
    }

    #[tokio::test]
    async fn snapshot_hash_is_upserted_per_job() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        assert_eq!(store.last_snapshot_hash("sync-parking").await.expect("read"), None);

        store.record_snapshot_hash("sync-parking", "aaa").await.expect("write");
        store.record_snapshot_hash("sync-parking", "bbb").await.expect("overwrite");
        assert_eq!(
            store.last_snapshot_hash("sync-parking").await.expect("read"),
            Some("bbb".to_string())
        );
    }

    #[tokio::test]
    async fn open_existing_never_creates_a_database() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db").join("parking.db");

        assert!(RegistryStore::open_existing(&path).await.is_err());
        assert!(!path.exists());

        let store = open_store(dir.path()).await;
        store.upsert(&lot("A", "a")).await.expect("insert");
        store.close().await;

        let existing = RegistryStore::open_existing(&path).await.expect("open existing");
        assert_eq!(existing.stats().await.expect("stats").total, 1);
    }

    #[tokio::test]
    async fn reopening_keeps_rows() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store.upsert(&lot("A", "a")).await.expect("insert");
        store.close().await;

        let store = open_store(dir.path()).await;
        assert_eq!(store.stats().await.expect("stats").total, 1);
    }
}
