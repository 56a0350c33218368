//! Snapshot reconciliation of the parking-lot registry.
//!
//! The registry feed is always a full snapshot, so an active lot that is absent
//! from the download is tombstoned, and a tombstoned lot that comes back is
//! revived with its original `created_at`.

use std::collections::BTreeSet;

use park_adapters::DecodeError;
use park_core::ParkingLotRecord;
use park_storage::{RegistryStore, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySyncResult {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub total_processed: u64,
    pub errors: Vec<String>,
    /// Set when the snapshot matched the previous run and nothing was written.
    pub skipped_unchanged: bool,
}

impl RegistrySyncResult {
    pub fn failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

/// SHA-256 over the decoded records ordered by id.
pub fn snapshot_hash(records: &[&ParkingLotRecord]) -> Result<String, serde_json::Error> {
    let mut ordered = records.to_vec();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    let mut hasher = Sha256::new();
    for record in ordered {
        hasher.update(serde_json::to_vec(record)?);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

pub struct Reconciler<'a> {
    store: &'a RegistryStore,
    skip_unchanged_job: Option<String>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a RegistryStore) -> Self {
        Self {
            store,
            skip_unchanged_job: None,
        }
    }

    /// Short-circuit when the snapshot hash equals the one last recorded for `job`.
    pub fn skip_unchanged(mut self, job: impl Into<String>) -> Self {
        self.skip_unchanged_job = Some(job.into());
        self
    }

    /// Apply one decoded snapshot. Only a failure to read the active baseline is
    /// returned as `Err`; per-record failures land in `errors`.
    pub async fn apply(
        &self,
        snapshot: Vec<Result<ParkingLotRecord, DecodeError>>,
    ) -> Result<RegistrySyncResult, StoreError> {
        let hash = self.unchanged_check_hash(&snapshot);
        if let (Some(job), Some(hash)) = (&self.skip_unchanged_job, &hash) {
            if self.store.last_snapshot_hash(job).await?.as_deref() == Some(hash.as_str()) {
                info!(job, "registry snapshot unchanged, skipping reconciliation");
                return Ok(RegistrySyncResult {
                    skipped_unchanged: true,
                    ..Default::default()
                });
            }
        }

        let before = self.store.active_ids().await?;
        let mut seen = BTreeSet::new();
        let mut result = RegistrySyncResult::default();

        for entry in snapshot {
            let record = match entry {
                Ok(record) => record,
                Err(err) => {
                    // A lot we failed to read is still present in the feed.
                    if let Some(id) = err.parking_id() {
                        seen.insert(id.to_string());
                    }
                    error!(error = %err, "skipping undecodable registry row");
                    result.errors.push(format!("decode failed: {err}"));
                    continue;
                }
            };

            seen.insert(record.id.clone());
            match self.store.upsert(&record).await {
                Ok((id, true)) => {
                    result.inserted += 1;
                    debug!(parking_id = %id, name = %record.name, "parking lot inserted");
                }
                Ok((id, false)) => {
                    result.updated += 1;
                    debug!(parking_id = %id, name = %record.name, "parking lot updated");
                }
                Err(err) => {
                    error!(parking_id = %record.id, error = %err, "registry upsert failed");
                    result
                        .errors
                        .push(format!("upsert failed (id={}): {err}", record.id));
                    continue;
                }
            }
            result.total_processed += 1;
        }

        let vanished: BTreeSet<String> = before.difference(&seen).cloned().collect();
        if !vanished.is_empty() {
            match self.store.mark_deleted(&vanished).await {
                Ok(count) => {
                    result.deleted = count;
                    info!(count, "parking lots tombstoned");
                }
                Err(err) => {
                    error!(error = %err, "tombstoning vanished parking lots failed");
                    result.errors.push(format!("mark deleted failed: {err}"));
                }
            }
        }

        if let (Some(job), Some(hash), true) =
            (&self.skip_unchanged_job, &hash, result.errors.is_empty())
        {
            if let Err(err) = self.store.record_snapshot_hash(job, hash).await {
                warn!(job, error = %err, "could not record snapshot hash");
            }
        }

        info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            total_processed = result.total_processed,
            errors = result.errors.len(),
            "registry reconciliation finished"
        );
        Ok(result)
    }

    fn unchanged_check_hash(
        &self,
        snapshot: &[Result<ParkingLotRecord, DecodeError>],
    ) -> Option<String> {
        self.skip_unchanged_job.as_ref()?;
        // A snapshot with bad rows always reconciles so the errors are reported.
        if snapshot.iter().any(Result::is_err) {
            return None;
        }
        let records: Vec<&ParkingLotRecord> = snapshot.iter().filter_map(|r| r.as_ref().ok()).collect();
        match snapshot_hash(&records) {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(error = %err, "could not hash snapshot, reconciling anyway");
                None
            }
        }
    }
}
