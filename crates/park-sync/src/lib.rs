//! Job orchestration for the parking feeds: registry reconciliation and
//! availability ingest, with configuration, logging and healthcheck pings.

pub mod config;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod telemetry;

pub use config::SyncConfig;
pub use ingest::{filter_observations, AvailabilitySyncResult, Ingester};
pub use notify::{HealthcheckNotifier, NoopNotifier, Notifier};
pub use pipeline::{
    JobOutcome, RegistrySyncOptions, StatsReport, SyncPipeline, AVAILABILITY_JOB, REGISTRY_JOB,
};
pub use reconcile::{snapshot_hash, Reconciler, RegistrySyncResult};
pub use telemetry::LogConfig;

pub const CRATE_NAME: &str = "park-sync";

/// Build a pipeline from the process environment and run the registry job once.
pub async fn sync_parking_from_env(
    options: RegistrySyncOptions,
) -> anyhow::Result<JobOutcome<RegistrySyncResult>> {
    SyncPipeline::new(SyncConfig::from_env())?
        .sync_parking(options)
        .await
}
