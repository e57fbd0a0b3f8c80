//! File-backed provider collaborator
//!
//! Reads instances and their utilization samples from a JSON snapshot that
//! an external exporter keeps up to date. Useful for air-gapped accounts
//! and for exercising the pipeline without cloud credentials.

use super::ProviderCollaborator;
use crate::cache::{CachedResource, ResourceCache};
use crate::models::{Instance, MetricKind, Provider};
use crate::observability::CarbonMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Collaborator reading a JSON array of instances from disk
pub struct SnapshotProvider {
    provider: Provider,
    path: PathBuf,
    cache: Arc<ResourceCache>,
    /// Ids this collaborator put in the shared cache
    owned: Mutex<HashSet<String>>,
    metrics: CarbonMetrics,
    closed: AtomicBool,
}

impl SnapshotProvider {
    pub fn new(provider: Provider, path: impl Into<PathBuf>, cache: Arc<ResourceCache>) -> Self {
        Self {
            provider,
            path: path.into(),
            cache,
            owned: Mutex::new(HashSet::new()),
            metrics: CarbonMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Remove owned resources from the cache, dropping their emissions series
    fn release<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            if let Some(resource) = self.cache.remove(id) {
                self.metrics.forget_instance(&resource);
            }
        }
    }

    /// Instances of this provider in the snapshot file
    async fn read_snapshot(&self) -> Result<Vec<Instance>> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("snapshot provider for {} is closed", self.path.display());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", self.path.display()))?;
        let instances: Vec<Instance> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot {}", self.path.display()))?;

        Ok(instances
            .into_iter()
            .filter(|i| i.provider == self.provider)
            .collect())
    }
}

#[async_trait]
impl ProviderCollaborator for SnapshotProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn refresh(&self, account: &str) -> Result<()> {
        let instances = self.read_snapshot().await?;
        let current: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();

        for instance in &instances {
            let vcpu = instance
                .metrics
                .get(MetricKind::Cpu)
                .map(|m| m.unit_amount as u32)
                .unwrap_or(0);
            self.cache.insert(CachedResource {
                id: instance.id.clone(),
                provider: instance.provider,
                region: instance.region.clone(),
                service: instance.service.clone(),
                kind: instance.kind.clone(),
                name: instance.name.clone(),
                vcpu,
                lifecycle: String::new(),
            });
        }

        // Instances dropped from the snapshot leave the cache
        let gone: Vec<String> = {
            let mut owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
            let gone: Vec<String> = owned.difference(&current).cloned().collect();
            *owned = current;
            gone
        };
        self.release(&gone);

        info!(
            account = %account,
            provider = %self.provider,
            instances = instances.len(),
            removed = gone.len(),
            "Refreshed instances from snapshot"
        );
        Ok(())
    }

    async fn metrics_for_instances(&self, interval: Duration) -> Result<Vec<Instance>> {
        let now = Utc::now();
        let mut discovered = Vec::new();

        for mut instance in self.read_snapshot().await? {
            if self.cache.get(&instance.id).is_none() {
                debug!(instance_id = %instance.id, "Instance not discovered yet, skipping");
                continue;
            }
            instance.collected_at = now;
            discovered.push(instance);
        }

        debug!(
            provider = %self.provider,
            instances = discovered.len(),
            interval_secs = interval.as_secs(),
            "Read instance metrics from snapshot"
        );
        Ok(discovered)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let owned = {
            let mut owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *owned)
        };
        self.release(&owned);
        info!(provider = %self.provider, path = %self.path.display(), "Closed snapshot provider");
        Ok(())
    }
}
