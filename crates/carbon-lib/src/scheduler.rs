//! Per-account collection scheduler
//!
//! Each configured account gets its own scheduler task. A pass refreshes the
//! provider's view of the account, fetches utilization metrics for the
//! sampling interval and publishes one `MetricsCollected` event per
//! instance. Passes run inside the scheduler task, so they never overlap:
//! ticks that fall due while a slow pass is still running are skipped.

use crate::bus::{Event, EventBus};
use crate::health::{components, HealthRegistry};
use crate::models::Instance;
use crate::observability::{CarbonMetrics, StructuredLogger};
use crate::provider::ProviderCollaborator;
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default sampling interval (5 minutes)
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on any single provider call
pub const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `cancel` waits for the task before aborting it
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Configuration for one account's scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Account, project or subscription identifier
    pub account: String,
    /// Sampling interval, also the tick period
    pub interval: Duration,
    /// Deadline for each provider call
    pub collection_timeout: Duration,
    /// Time `cancel` waits for an in-flight pass to unwind
    pub cancel_grace: Duration,
}

impl SchedulerConfig {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            interval: DEFAULT_INTERVAL,
            collection_timeout: DEFAULT_COLLECTION_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Lifecycle of a scheduler; there is no way back to `Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Cancelled,
}

/// State shared with the spawned collection task
struct Collector {
    config: SchedulerConfig,
    provider: Arc<dyn ProviderCollaborator>,
    bus: Arc<EventBus>,
    health: Option<HealthRegistry>,
    metrics: CarbonMetrics,
    logger: StructuredLogger,
    passes: AtomicU64,
}

impl Collector {
    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        info!(
            account = %self.config.account,
            provider = %self.provider.provider(),
            interval_secs = self.config.interval.as_secs(),
            "Starting scheduler"
        );

        // The first tick completes immediately, giving a pass at startup.
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *cancel.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    warn!(
                        account = %self.config.account,
                        "Cancelled during collection pass, abandoning it"
                    );
                    break;
                }
                _ = self.process() => {}
            }
        }

        info!(account = %self.config.account, "Scheduler loop stopped");
    }

    /// Run one collection pass, logging and abandoning it on failure
    async fn process(&self) {
        let account = &self.config.account;
        if account.is_empty() {
            warn!(provider = %self.provider.provider(), "No account configured, skipping pass");
            return;
        }

        let start = Instant::now();
        match self.collect().await {
            Ok(instances) => {
                let elapsed = start.elapsed();
                self.metrics.observe_collection_latency(elapsed.as_secs_f64());
                self.metrics.add_instances_collected(instances.len() as u64);

                let count = instances.len();
                for instance in instances {
                    self.bus
                        .publish(Event::metrics_collected(instance, self.config.interval));
                }

                let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    account = %account,
                    instances = count,
                    elapsed_ms = elapsed.as_millis(),
                    pass,
                    "Collection pass complete"
                );
                if let Some(health) = &self.health {
                    health.set_healthy(components::SCHEDULER).await;
                }
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                self.logger.log_collection_failure(account, &reason);
                self.metrics.inc_collection_errors(account);
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::SCHEDULER, format!("{}: {}", account, reason))
                        .await;
                }
            }
        }
    }

    async fn collect(&self) -> Result<Vec<Instance>> {
        let account = &self.config.account;
        self.bounded("refresh", self.provider.refresh(account))
            .await
            .context("Failed to refresh instances")?;
        self.bounded(
            "metrics",
            self.provider.metrics_for_instances(self.config.interval),
        )
        .await
        .context("Failed to collect instance metrics")
    }

    /// Apply the collection deadline to a provider call
    async fn bounded<T>(&self, call: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.collection_timeout, fut)
            .await
            .map_err(|_| {
                anyhow!(
                    "provider {} call timed out after {:?}",
                    call,
                    self.config.collection_timeout
                )
            })?
    }
}

/// Recurring metrics collection for one provider account
pub struct Scheduler {
    collector: Arc<Collector>,
    state: Mutex<SchedulerState>,
    cancel_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        provider: Arc<dyn ProviderCollaborator>,
        bus: Arc<EventBus>,
        health: Option<HealthRegistry>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let logger = StructuredLogger::new(format!("scheduler/{}", config.account));
        Self {
            collector: Arc::new(Collector {
                config,
                provider,
                bus,
                health,
                metrics: CarbonMetrics::new(),
                logger,
                passes: AtomicU64::new(0),
            }),
            state: Mutex::new(SchedulerState::Idle),
            cancel_tx,
            task: Mutex::new(None),
        }
    }

    pub fn account(&self) -> &str {
        &self.collector.config.account
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of collection passes that completed successfully
    pub fn pass_count(&self) -> u64 {
        self.collector.passes.load(Ordering::SeqCst)
    }

    /// Start the collection loop on the current tokio runtime.
    ///
    /// A pass runs immediately, then once per interval. Fails if the
    /// scheduler was already scheduled or cancelled.
    pub fn schedule(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                SchedulerState::Idle => *state = SchedulerState::Scheduled,
                other => anyhow::bail!(
                    "scheduler for account {} cannot be scheduled from state {:?}",
                    self.account(),
                    other
                ),
            }
        }

        let cancel_rx = self.cancel_tx.subscribe();
        let handle = tokio::spawn(self.collector.clone().run(cancel_rx));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(account = %self.account(), "Scheduled collection");
        Ok(())
    }

    /// Stop the loop and release the provider.
    ///
    /// An in-flight pass is abandoned. If the task does not stop within the
    /// grace period it is aborted. Calling `cancel` again is a no-op. Calling
    /// it before `schedule` releases the provider and leaves the scheduler
    /// unusable.
    pub async fn cancel(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, SchedulerState::Cancelled)
        };
        if previous == SchedulerState::Cancelled {
            debug!(account = %self.account(), "Scheduler already cancelled");
            return Ok(());
        }

        self.cancel_tx.send_replace(true);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = task {
            let grace = self.collector.config.cancel_grace;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    account = %self.account(),
                    grace_ms = grace.as_millis(),
                    "Scheduler task did not stop in time, aborting"
                );
                handle.abort();
            }
        }

        let provider = &self.collector.provider;
        provider.shutdown().await;
        provider
            .close()
            .await
            .with_context(|| format!("Failed to close provider for account {}", self.account()))?;

        info!(account = %self.account(), "Scheduler cancelled");
        Ok(())
    }
}

/// Builder for creating a scheduler
pub struct SchedulerBuilder {
    provider: Option<Arc<dyn ProviderCollaborator>>,
    bus: Option<Arc<EventBus>>,
    health: Option<HealthRegistry>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Create a new builder with default timing for `account`
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            provider: None,
            bus: None,
            health: None,
            config: SchedulerConfig::new(account),
        }
    }

    /// Set the provider collaborator
    pub fn provider(mut self, provider: Arc<dyn ProviderCollaborator>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the bus events are published on
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Report pass outcomes to a health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the sampling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the deadline for provider calls
    pub fn collection_timeout(mut self, timeout: Duration) -> Self {
        self.config.collection_timeout = timeout;
        self
    }

    /// Set the cancellation grace period
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow!("Provider is required"))?;
        let bus = self.bus.ok_or_else(|| anyhow!("Event bus is required"))?;

        Ok(Scheduler::new(self.config, provider, bus, self.health))
    }
}
