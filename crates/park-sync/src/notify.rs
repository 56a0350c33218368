//! Liveness pings sent after a clean run.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_success(&self, job: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_success(&self, _job: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// GETs a healthcheck URL (e.g. healthchecks.io). No URL means nothing to do.
#[derive(Debug)]
pub struct HealthcheckNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl HealthcheckNotifier {
    pub fn new(url: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building healthcheck client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for HealthcheckNotifier {
    async fn notify_success(&self, job: &str) -> anyhow::Result<()> {
        let Some(url) = &self.url else {
            debug!(job, "no healthcheck url configured, skipping ping");
            return Ok(());
        };

        self.client
            .get(url)
            .send()
            .await
            .with_context(|| format!("pinging healthcheck for {job}"))?
            .error_for_status()
            .with_context(|| format!("healthcheck for {job} rejected the ping"))?;
        info!(job, url = %url, "healthcheck pinged");
        Ok(())
    }
}
