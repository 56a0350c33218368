//! The two scheduled jobs: lock, fetch, decode, apply, ping, unlock.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use park_adapters::{AvailabilityFeed, FeedAdapter, RegistryFeed};
use park_core::PartitionId;
use park_storage::{
    AuditLog, FeedFetcher, HttpClientConfig, HttpFetcher, LockError, PartitionStats, RegistryStats,
    RegistryStore, RunGuard, RunLock, TimeSeriesStore,
};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::ingest::{AvailabilitySyncResult, Ingester};
use crate::notify::{HealthcheckNotifier, Notifier};
use crate::reconcile::{Reconciler, RegistrySyncResult};

pub const REGISTRY_JOB: &str = "sync-parking";
pub const AVAILABILITY_JOB: &str = "sync-availability";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Completed { run_id: Uuid, result: T },
    /// Another process holds the job's lock; nothing was touched.
    AlreadyRunning { holder_pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySyncOptions {
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// `None` until the registry database has been created by a first sync.
    pub registry: Option<RegistryStats>,
    pub partitions: Vec<PartitionId>,
    pub month: PartitionStats,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Box<dyn FeedFetcher>,
    parking_notifier: Box<dyn Notifier>,
    availability_notifier: Box<dyn Notifier>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let mut http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        if config.audit_responses {
            http = http.with_audit_log(AuditLog::new(config.responses_dir.clone()));
        }
        let parking_notifier = HealthcheckNotifier::new(config.healthcheck_parking_url.clone())?;
        let availability_notifier =
            HealthcheckNotifier::new(config.healthcheck_availability_url.clone())?;

        Ok(Self {
            config,
            fetcher: Box::new(http),
            parking_notifier: Box::new(parking_notifier),
            availability_notifier: Box::new(availability_notifier),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn FeedFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_notifiers(
        mut self,
        parking: Box<dyn Notifier>,
        availability: Box<dyn Notifier>,
    ) -> Self {
        self.parking_notifier = parking;
        self.availability_notifier = availability;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn sync_parking(
        &self,
        options: RegistrySyncOptions,
    ) -> Result<JobOutcome<RegistrySyncResult>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_parking", %run_id, job = REGISTRY_JOB);
        self.run_registry_job(run_id, options).instrument(span).await
    }

    pub async fn sync_availability(&self) -> Result<JobOutcome<AvailabilitySyncResult>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_availability", %run_id, job = AVAILABILITY_JOB);
        self.run_availability_job(run_id).instrument(span).await
    }

    async fn run_registry_job(
        &self,
        run_id: Uuid,
        options: RegistrySyncOptions,
    ) -> Result<JobOutcome<RegistrySyncResult>> {
        let guard = match self.acquire(REGISTRY_JOB)? {
            Ok(guard) => guard,
            Err(holder_pid) => return Ok(JobOutcome::AlreadyRunning { holder_pid }),
        };
        let started = Instant::now();
        let result = self.reconcile_registry(options).await;

        if let Ok(result) = &result {
            if result.errors.is_empty() {
                ping(self.parking_notifier.as_ref(), REGISTRY_JOB).await;
            }
            info!(
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                skipped_unchanged = result.skipped_unchanged,
                errors = result.errors.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "parking registry sync finished"
            );
        }
        release(guard);
        Ok(JobOutcome::Completed {
            run_id,
            result: result?,
        })
    }

    async fn run_availability_job(&self, run_id: Uuid) -> Result<JobOutcome<AvailabilitySyncResult>> {
        let guard = match self.acquire(AVAILABILITY_JOB)? {
            Ok(guard) => guard,
            Err(holder_pid) => return Ok(JobOutcome::AlreadyRunning { holder_pid }),
        };
        let started = Instant::now();
        let result = self.ingest_availability().await;

        if result.errors.is_empty() {
            ping(self.availability_notifier.as_ref(), AVAILABILITY_JOB).await;
        }
        info!(
            inserted = result.inserted,
            skipped_invalid = result.skipped_invalid,
            errors = result.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "availability sync finished"
        );
        release(guard);
        Ok(JobOutcome::Completed { run_id, result })
    }

    /// Registry counts, partitions on disk and one month's summary. Read-only.
    pub async fn stats(&self, partition: PartitionId) -> Result<StatsReport> {
        let registry = if tokio::fs::try_exists(&self.config.db_path)
            .await
            .with_context(|| format!("checking {}", self.config.db_path.display()))?
        {
            let store = RegistryStore::open_existing(&self.config.db_path)
                .await
                .with_context(|| format!("opening {}", self.config.db_path.display()))?;
            let stats = store.stats().await;
            store.close().await;
            Some(stats.context("reading registry stats")?)
        } else {
            None
        };

        let series = TimeSeriesStore::new(self.config.availability_db_dir.clone());
        let partitions = series
            .list_partitions()
            .await
            .context("listing availability partitions")?;
        let month = series
            .stats(partition)
            .await
            .with_context(|| format!("reading stats for partition {partition}"))?;

        Ok(StatsReport {
            registry,
            partitions,
            month,
        })
    }

    /// Newest audit files first.
    pub async fn recent_responses(&self, limit: usize) -> Result<Vec<PathBuf>> {
        let mut files = AuditLog::new(self.config.responses_dir.clone()).list().await?;
        files.truncate(limit);
        Ok(files)
    }

    /// `Ok(Err(pid))` when the lock is held elsewhere.
    fn acquire(&self, job: &str) -> Result<std::result::Result<RunGuard, Option<u32>>> {
        let lock = RunLock::new(job, &self.config.lock_dir)?;
        match lock.acquire() {
            Ok(guard) => {
                info!(lock = %guard.path().display(), "run lock acquired");
                Ok(Ok(guard))
            }
            Err(LockError::Held { holder_pid, .. }) => {
                warn!(?holder_pid, "another run holds the lock, exiting");
                Ok(Err(holder_pid))
            }
            Err(err) => Err(err).with_context(|| format!("acquiring run lock for {job}")),
        }
    }

    async fn reconcile_registry(&self, options: RegistrySyncOptions) -> Result<RegistrySyncResult> {
        let feed = RegistryFeed::new(self.config.parking_lot_url.clone());
        let response = match self.fetcher.fetch(feed.url()).await {
            Ok(response) => response,
            Err(err) => {
                error!(source = feed.source_id(), error = %err, "registry download failed");
                return Ok(RegistrySyncResult::failed(format!("fetch failed: {err}")));
            }
        };

        let snapshot = feed.decode(&response.text());
        info!(rows = snapshot.len(), "registry snapshot decoded");
        if snapshot.is_empty() {
            error!("registry snapshot has no rows, refusing to tombstone the registry");
            return Ok(RegistrySyncResult::failed(
                "registry snapshot is empty".to_string(),
            ));
        }

        let store = RegistryStore::open(&self.config.db_path)
            .await
            .with_context(|| format!("opening registry {}", self.config.db_path.display()))?;
        let result = {
            let mut reconciler = Reconciler::new(&store);
            if options.skip_unchanged {
                reconciler = reconciler.skip_unchanged(REGISTRY_JOB);
            }
            reconciler.apply(snapshot).await
        };
        store.close().await;
        result.context("reconciling parking registry")
    }

    async fn ingest_availability(&self) -> AvailabilitySyncResult {
        let feed = AvailabilityFeed::new(self.config.availability_url.clone());
        let response = match self.fetcher.fetch(feed.url()).await {
            Ok(response) => response,
            Err(err) => {
                error!(source = feed.source_id(), error = %err, "availability download failed");
                return AvailabilitySyncResult::failed(format!("fetch failed: {err}"));
            }
        };

        let raw = feed.decode(&response.text());
        info!(rows = raw.len(), "availability feed decoded");
        let series = TimeSeriesStore::new(self.config.availability_db_dir.clone());
        Ingester::new(&series).ingest(raw).await
    }
}

async fn ping(notifier: &dyn Notifier, job: &str) {
    if let Err(err) = notifier.notify_success(job).await {
        warn!(job, error = %format!("{err:#}"), "healthcheck ping failed");
    }
}

fn release(guard: RunGuard) {
    if let Err(err) = guard.release() {
        warn!(error = %err, "releasing run lock failed");
    }
}
