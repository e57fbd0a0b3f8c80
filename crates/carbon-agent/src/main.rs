//! Carbon Agent - cloud compute emissions pipeline
//!
//! Runs one collection scheduler per configured account, converts the
//! collected utilization into emissions and exposes health and metrics.

use anyhow::{Context, Result};
use carbon_agent::{api, config::AgentConfig};
use carbon_lib::{
    bus::{EventBus, Topic},
    cache::ResourceCache,
    calculator::Calculator,
    factors::DatasetStore,
    health::{components, HealthRegistry},
    models::Provider,
    observability::{CarbonMetrics, EmissionsReporter, StructuredLogger},
    provider::SnapshotProvider,
    scheduler::Scheduler,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "carbon-agent", version, about = "Cloud compute carbon emissions agent")]
struct Args {
    /// Configuration file (JSON, YAML or TOML)
    #[arg(short, long, env = "CARBON_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref())?;
    info!(
        agent = %config.agent_name,
        dataset = %config.dataset_path.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::CALCULATOR).await;
    health_registry.register(components::EMISSION_FACTORS).await;

    let metrics = CarbonMetrics::new();
    let logger = StructuredLogger::new(&config.agent_name);

    let providers = config.enabled_providers();
    let store = Arc::new(DatasetStore::new(config.dataset_path.clone()));
    let calculator =
        Arc::new(Calculator::new(store, &providers).with_health(health_registry.clone()));
    report_factor_health(&health_registry, &calculator, &providers).await;

    let bus = Arc::new(EventBus::new());
    bus.subscribe(Topic::MetricsCollected, calculator.clone());
    bus.subscribe(
        Topic::EmissionsCalculated,
        Arc::new(EmissionsReporter::new(logger.clone(), metrics.clone())),
    );

    let cache = Arc::new(match config.cache_expiry() {
        Some(expiry) => ResourceCache::with_expiry(expiry),
        None => ResourceCache::new(),
    });

    let mut schedulers = Vec::new();
    for provider in &providers {
        for account in config.accounts(*provider) {
            let collaborator = Arc::new(SnapshotProvider::new(
                *provider,
                account.snapshot_path.clone(),
                cache.clone(),
            ));
            let scheduler = Scheduler::new(
                config.scheduler_config(account),
                collaborator,
                bus.clone(),
                Some(health_registry.clone()),
            );
            scheduler.schedule().with_context(|| {
                format!("Failed to schedule {} account {}", provider, account.id)
            })?;
            schedulers.push(scheduler);
        }
    }
    if schedulers.is_empty() {
        warn!("No accounts configured, only serving health endpoints");
    }

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    if let Some(period) = config.factors_reload() {
        background.push(tokio::spawn(reload_factors(
            period,
            calculator.clone(),
            providers.clone(),
            health_registry.clone(),
        )));
    }
    if let Some(expiry) = config.cache_expiry() {
        background.push(tokio::spawn(evict_cache(
            expiry,
            cache.clone(),
            metrics.clone(),
        )));
    }

    logger.log_startup(AGENT_VERSION, schedulers.len());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async {
        let _ = shutdown_rx.await;
    }));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    for scheduler in &schedulers {
        if let Err(e) = scheduler.cancel().await {
            warn!(
                account = %scheduler.account(),
                error = %format!("{:#}", e),
                "Failed to cancel scheduler"
            );
        }
    }
    for task in background {
        task.abort();
    }
    bus.stop();

    let _ = shutdown_tx.send(());
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Reflect which providers have emission factors loaded
async fn report_factor_health(
    health: &HealthRegistry,
    calculator: &Calculator,
    providers: &[Provider],
) {
    let loaded = calculator.loaded_providers();
    let missing: Vec<&str> = providers
        .iter()
        .filter(|p| !loaded.contains(p))
        .map(|p| p.as_str())
        .collect();

    if missing.is_empty() {
        health.set_healthy(components::EMISSION_FACTORS).await;
    } else if loaded.is_empty() {
        health
            .set_unhealthy(components::EMISSION_FACTORS, "No emission factors loaded")
            .await;
    } else {
        health
            .set_degraded(
                components::EMISSION_FACTORS,
                format!("Missing emission factors for {}", missing.join(", ")),
            )
            .await;
    }
}

async fn reload_factors(
    period: Duration,
    calculator: Arc<Calculator>,
    providers: Vec<Provider>,
    health: HealthRegistry,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick is immediate and the tables were just loaded.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if calculator.reload() {
            report_factor_health(&health, &calculator, &providers).await;
        }
    }
}

async fn evict_cache(expiry: Duration, cache: Arc<ResourceCache>, metrics: CarbonMetrics) {
    let mut ticker = tokio::time::interval(expiry);
    loop {
        ticker.tick().await;
        let evicted = cache.evict_expired();
        for resource in &evicted {
            metrics.forget_instance(resource);
        }
        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                remaining = cache.len(),
                "Evicted expired resources"
            );
        }
    }
}
