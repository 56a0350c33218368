//! Gzip-compressed request/response audit trail, one directory per month.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use park_core::{format_timestamp, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const EXCHANGE_SUFFIX: &str = ".json.gz";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub timestamp: String,
    pub request: ExchangeRequest,
    pub response: ExchangeResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub method: String,
    pub url: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the body as text.
    pub body: JsonValue,
}

impl Exchange {
    pub fn get(
        timestamp: &Timestamp,
        endpoint: &str,
        final_url: &str,
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> Self {
        let body = serde_json::from_slice(body)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(body).into_owned()));
        Self {
            timestamp: format_timestamp(timestamp),
            request: ExchangeRequest {
                method: "GET".to_string(),
                url: final_url.to_string(),
                endpoint: endpoint.to_string(),
            },
            response: ExchangeResponse {
                status_code,
                headers,
                body,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredExchange {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    root: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First 8 hex chars of the endpoint's SHA-256.
    pub fn endpoint_hash(endpoint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(8);
        digest
    }

    /// `YYYYMM/YYYYMMDD_HHMMSS_<hash8>.json.gz`
    pub fn exchange_relative_path(timestamp: &Timestamp, endpoint: &str) -> PathBuf {
        let month = timestamp.format("%Y%m").to_string();
        let stamp = timestamp.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(month).join(format!(
            "{stamp}_{}{EXCHANGE_SUFFIX}",
            Self::endpoint_hash(endpoint)
        ))
    }

    /// Compress and write one exchange through a temp file + rename.
    pub async fn record(
        &self,
        timestamp: &Timestamp,
        exchange: &Exchange,
    ) -> anyhow::Result<StoredExchange> {
        let base_path = Self::exchange_relative_path(timestamp, &exchange.request.endpoint);
        let parent = self
            .root
            .join(&base_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating audit directory {}", parent.display()))?;

        let json = serde_json::to_vec_pretty(exchange).context("serializing exchange")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).context("compressing exchange")?;
        let bytes = encoder.finish().context("finishing gzip stream")?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp audit file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp audit file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp audit file {}", temp_path.display()))?;
        drop(file);

        let relative_path = match self.free_relative_path(&base_path).await {
            Ok(path) => path,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };
        let absolute_path = self.root.join(&relative_path);
        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp audit file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredExchange {
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    /// `base` itself, or `<stem>_NNN.json.gz` when exchanges land in the same second.
    async fn free_relative_path(&self, base: &Path) -> anyhow::Result<PathBuf> {
        let name = base
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let stem = name.strip_suffix(EXCHANGE_SUFFIX).unwrap_or(name);
        let mut candidate = base.to_path_buf();
        let mut n = 0u32;
        while fs::try_exists(self.root.join(&candidate))
            .await
            .with_context(|| format!("checking {}", candidate.display()))?
        {
            n += 1;
            candidate = base.with_file_name(format!("{stem}_{n:03}{EXCHANGE_SUFFIX}"));
        }
        Ok(candidate)
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Exchange> {
        let path = path.as_ref();
        let compressed = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .with_context(|| format!("decompressing {}", path.display()))?;
        serde_json::from_slice(&json).with_context(|| format!("parsing {}", path.display()))
    }

    /// Every stored exchange, newest first. File names sort chronologically.
    pub async fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut months = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        while let Some(month) = months.next_entry().await? {
            if !month.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(month.path())
                .await
                .with_context(|| format!("reading {}", month.path().display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let is_exchange = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(EXCHANGE_SUFFIX) && !name.starts_with('.'));
                if is_exchange {
                    files.push(entry.path());
                }
            }
        }
        files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use tempfile::tempdir;

    fn at(month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Timestamp {
        FixedOffset::east_opt(8 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, month, day, hour, minute, second)
            .single()
            .expect("ts")
    }

    fn exchange(timestamp: &Timestamp, endpoint: &str, body: &[u8]) -> Exchange {
        Exchange::get(
            timestamp,
            endpoint,
            endpoint,
            200,
            BTreeMap::from([("content-type".to_string(), "text/csv".to_string())]),
            body,
        )
    }

    #[test]
    fn exchange_paths_are_month_scoped_and_stable() {
        let ts = at(2, 4, 10, 30, 45);
        let path = AuditLog::exchange_relative_path(&ts, "/api/test");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");

        assert_eq!(path.parent(), Some(Path::new("202602")));
        assert!(name.starts_with("20260204_103045_"));
        assert!(name.ends_with(".json.gz"));
        assert_eq!(path, AuditLog::exchange_relative_path(&ts, "/api/test"));
        assert_ne!(path, AuditLog::exchange_relative_path(&ts, "/api/other"));
        assert_eq!(AuditLog::endpoint_hash("/api/test").len(), 8);
    }

    #[tokio::test]
    async fn recorded_exchange_loads_back() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let ts = at(2, 4, 10, 30, 45);
        let original = exchange(&ts, "/api/parking", "ID,NAME\n1,中文測試\n".as_bytes());

        let stored = log.record(&ts, &original).await.expect("record");
        assert!(stored.absolute_path.exists());
        assert!(stored.byte_size > 0);

        let loaded = AuditLog::load(&stored.absolute_path).await.expect("load");
        assert_eq!(loaded, original);
        assert_eq!(
            loaded.response.body,
            JsonValue::String("ID,NAME\n1,中文測試\n".to_string())
        );
    }

    #[tokio::test]
    async fn json_bodies_are_kept_structured() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let ts = at(2, 4, 10, 0, 0);
        let stored = log
            .record(&ts, &exchange(&ts, "/api/json", br#"{"ok":true}"#))
            .await
            .expect("record");

        let loaded = AuditLog::load(&stored.absolute_path).await.expect("load");
        assert_eq!(loaded.response.body, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn same_second_exchanges_get_distinct_files() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let ts = at(3, 1, 9, 0, 0);

        let failed = Exchange::get(&ts, "/api/a", "/api/a", 503, BTreeMap::new(), b"");
        let first = log.record(&ts, &failed).await.expect("first");
        let second = log
            .record(&ts, &exchange(&ts, "/api/a", b"ok"))
            .await
            .expect("second");

        assert_ne!(first.absolute_path, second.absolute_path);
        assert_eq!(
            log.list().await.expect("list"),
            vec![second.absolute_path.clone(), first.absolute_path.clone()]
        );
        let loaded = AuditLog::load(&first.absolute_path).await.expect("load");
        assert_eq!(loaded.response.status_code, 503);
    }

    #[tokio::test]
    async fn list_spans_months_newest_first() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        assert!(log.list().await.expect("empty list").is_empty());

        let january = at(1, 15, 10, 0, 0);
        let february = at(2, 15, 10, 0, 0);
        let first = log
            .record(&january, &exchange(&january, "/api/a", b"a"))
            .await
            .expect("jan");
        let second = log
            .record(&february, &exchange(&february, "/api/b", b"b"))
            .await
            .expect("feb");

        assert_eq!(
            log.list().await.expect("list"),
            vec![second.absolute_path, first.absolute_path]
        );
    }
}
