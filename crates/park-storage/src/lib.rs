//! Durable stores, run locking, audit trail and HTTP fetch for the parking sync.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

pub mod audit;
pub mod fetch;
pub mod lock;
pub mod registry;
pub mod timeseries;

pub use audit::{AuditLog, Exchange, StoredExchange};
pub use fetch::{
    BackoffPolicy, FeedFetcher, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
};
pub use lock::{LockError, RunGuard, RunLock};
pub use registry::{RegistryStats, RegistryStore};
pub use timeseries::{Partition, PartitionStats, TimeSeriesStore};

pub const CRATE_NAME: &str = "park-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid timestamp {value:?} in column {column}: {source}")]
    Timestamp {
        column: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Single-connection pool: every invocation is one sequential writer.
pub(crate) async fn open_sqlite(path: &Path, create: bool) -> Result<SqlitePool, StoreError> {
    if create {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}
