use std::path::PathBuf;

use park_adapters::{AVAILABILITY_API_URL, PARKING_LOT_API_URL};

use crate::telemetry::LogConfig;

/// Process-wide settings, read once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub availability_db_dir: PathBuf,
    pub responses_dir: PathBuf,
    pub audit_responses: bool,
    pub lock_dir: PathBuf,
    pub parking_lot_url: String,
    pub availability_url: String,
    pub healthcheck_parking_url: Option<String>,
    pub healthcheck_availability_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub logging: LogConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path_or = |key: &str, default: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            db_path: path_or("DB_PATH", "./data/db/parking.db"),
            availability_db_dir: path_or("AVAILABILITY_DB_DIR", "./data/availability"),
            responses_dir: path_or("RESPONSES_PATH", "./data/responses"),
            audit_responses: get("AUDIT_RESPONSES")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            lock_dir: get("LOCK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            parking_lot_url: get("PARKING_LOT_API_URL")
                .unwrap_or_else(|| PARKING_LOT_API_URL.to_string()),
            availability_url: get("AVAILABILITY_API_URL")
                .unwrap_or_else(|| AVAILABILITY_API_URL.to_string()),
            healthcheck_parking_url: get("HEALTHCHECK_PARKING_URL"),
            healthcheck_availability_url: get("HEALTHCHECK_AVAILABILITY_URL"),
            user_agent: get("PARK_USER_AGENT").unwrap_or_else(|| "park-sync/0.1".to_string()),
            http_timeout_secs: get("PARK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            logging: LogConfig {
                level: get("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
                log_dir: Some(path_or("LOG_DIR", "./logs")),
                file_name: "app.log".to_string(),
            },
        }
    }

    /// Key/value view for `--debug` output.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
        vec![
            ("db_path", self.db_path.display().to_string()),
            ("availability_db_dir", self.availability_db_dir.display().to_string()),
            ("responses_dir", self.responses_dir.display().to_string()),
            ("audit_responses", self.audit_responses.to_string()),
            ("lock_dir", self.lock_dir.display().to_string()),
            ("parking_lot_url", self.parking_lot_url.clone()),
            ("availability_url", self.availability_url.clone()),
            ("healthcheck_parking_url", or_unset(&self.healthcheck_parking_url)),
            (
                "healthcheck_availability_url",
                or_unset(&self.healthcheck_availability_url),
            ),
            ("user_agent", self.user_agent.clone()),
            ("http_timeout_secs", self.http_timeout_secs.to_string()),
            ("log_level", self.logging.level.clone()),
            (
                "log_dir",
                self.logging
                    .log_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "(stdout only)".to_string()),
            ),
        ]
    }
}
