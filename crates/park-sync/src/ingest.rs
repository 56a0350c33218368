use park_core::{now_local, AvailabilityObservation, RawObservation, Timestamp, INVALID_AVAILABILITY};
use park_storage::TimeSeriesStore;
use serde::Serialize;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilitySyncResult {
    pub inserted: u64,
    pub skipped_invalid: u64,
    pub total_downloaded: u64,
    pub errors: Vec<String>,
}

impl AvailabilitySyncResult {
    pub fn failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

/// Keep parseable, non-sentinel readings. Returns them with the sentinel count.
pub fn filter_observations(raw: Vec<RawObservation>) -> (Vec<AvailabilityObservation>, u64) {
    let mut valid = Vec::with_capacity(raw.len());
    let mut sentinels = 0u64;

    for row in raw {
        let parking_id = row.parking_id.trim();
        let count = row.available_car.trim();
        if parking_id.is_empty() || count.is_empty() {
            continue;
        }
        let Ok(available_car) = count.parse::<i64>() else {
            debug!(parking_id, value = count, "dropping non-numeric availability");
            continue;
        };
        if available_car == INVALID_AVAILABILITY {
            sentinels += 1;
            continue;
        }
        valid.push(AvailabilityObservation {
            parking_id: parking_id.to_string(),
            available_car,
        });
    }

    (valid, sentinels)
}

pub struct Ingester<'a> {
    store: &'a TimeSeriesStore,
}

impl<'a> Ingester<'a> {
    pub fn new(store: &'a TimeSeriesStore) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, raw: Vec<RawObservation>) -> AvailabilitySyncResult {
        self.ingest_at(raw, now_local()).await
    }

    /// Filter and append one download as a single batch stamped `now`.
    pub async fn ingest_at(&self, raw: Vec<RawObservation>, now: Timestamp) -> AvailabilitySyncResult {
        let (valid, skipped_invalid) = filter_observations(raw);
        let mut result = AvailabilitySyncResult {
            skipped_invalid,
            total_downloaded: valid.len() as u64 + skipped_invalid,
            ..Default::default()
        };

        match self.store.append_batch_at(&valid, now).await {
            Ok(written) => result.inserted = written,
            Err(err) => {
                error!(error = %err, rows = valid.len(), "availability batch write failed");
                result.errors.push(format!("batch insert failed: {err}"));
            }
        }

        info!(
            inserted = result.inserted,
            skipped_invalid = result.skipped_invalid,
            total_downloaded = result.total_downloaded,
            "availability ingest finished"
        );
        result
    }
}
