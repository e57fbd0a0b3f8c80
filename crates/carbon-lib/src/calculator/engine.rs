//! Calculator engine subscribed to collected metrics
//!
//! Owns the per-provider factor tables loaded at construction. Every
//! collected instance is resolved against them, annotated with operational
//! and embodied emissions, and republished as an emissions event.

use super::{embodied_emissions, operational_emissions, CalcError, Parameters};
use crate::bus::{Event, EventBus, EventHandler};
use crate::factors::{FactorError, FactorStore, ModelTier, ProviderFactors};
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::{Instance, MetricKind, Provider, ResourceEmission};
use crate::observability::CarbonMetrics;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of calculating one metric
#[derive(Debug)]
pub enum MetricOutcome {
    /// Operational emissions in grams CO2e, attached to the metric
    Calculated(f64),
    /// The metric kind has no emissions model yet; nothing was attached
    NotImplemented,
    /// The calculation failed; nothing was attached
    Failed(CalcError),
}

/// An annotated instance plus per-metric outcomes
#[derive(Debug)]
pub struct CalculationReport {
    pub instance: Instance,
    pub tier: ModelTier,
    pub outcomes: Vec<(MetricKind, MetricOutcome)>,
}

impl CalculationReport {
    pub fn outcome(&self, kind: MetricKind) -> Option<&MetricOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }
}

/// Emissions calculator
pub struct Calculator {
    store: Arc<dyn FactorStore>,
    providers: Vec<Provider>,
    factors: RwLock<HashMap<Provider, ProviderFactors>>,
    fingerprint: RwLock<Option<String>>,
    metrics: CarbonMetrics,
    health: Option<HealthRegistry>,
}

impl Calculator {
    /// Create a calculator, loading factors for each provider from `store`.
    ///
    /// A provider whose data fails to load is logged and left out; its
    /// instances are skipped until a successful [`Calculator::reload`].
    pub fn new(store: Arc<dyn FactorStore>, providers: &[Provider]) -> Self {
        let calculator = Self {
            store,
            providers: providers.to_vec(),
            factors: RwLock::new(HashMap::new()),
            fingerprint: RwLock::new(None),
            metrics: CarbonMetrics::new(),
            health: None,
        };
        calculator.load();
        calculator
    }

    /// Report instance-level failures to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Load tables for every provider, returning how many loaded.
    ///
    /// A provider that fails keeps the tables of its last successful load.
    /// The fingerprint is only recorded when every provider loaded, so a
    /// later reload retries the failed ones.
    fn load(&self) -> usize {
        let fingerprint = self.store.fingerprint();

        let mut loaded = HashMap::new();
        let mut failed = Vec::new();
        for &provider in &self.providers {
            match Self::load_provider(self.store.as_ref(), provider) {
                Ok(factors) => {
                    loaded.insert(provider, factors);
                }
                Err(e) => failed.push((provider, e)),
            }
        }

        let count = loaded.len();
        {
            let mut factors = self.factors.write().unwrap_or_else(|e| e.into_inner());
            for (provider, e) in &failed {
                if factors.contains_key(provider) {
                    warn!(
                        provider = %provider,
                        error = %e,
                        "Failed to reload emission factors, keeping previous tables"
                    );
                } else {
                    error!(provider = %provider, error = %e, "Failed to load emission factors");
                }
            }
            factors.extend(loaded);
        }

        if failed.is_empty() {
            *self.fingerprint.write().unwrap_or_else(|e| e.into_inner()) = fingerprint;
        }
        count
    }

    fn load_provider(
        store: &dyn FactorStore,
        provider: Provider,
    ) -> Result<ProviderFactors, FactorError> {
        let factors = store.provider_factors(provider)?;
        // The precise tier is optional; without it every kind uses the fallback model.
        let instances = store.provider_instances(provider).unwrap_or_else(|e| {
            warn!(
                provider = %provider,
                error = %e,
                "Failed to load instance dataset, falling back to embodied specs"
            );
            HashMap::new()
        });

        Ok(ProviderFactors {
            provider,
            factors,
            instances,
        })
    }

    /// Reload factor tables from the store.
    ///
    /// Returns false without touching the tables when the store reports the
    /// same fingerprint as the last load.
    pub fn reload(&self) -> bool {
        let current = self.store.fingerprint();
        let previous = self
            .fingerprint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if current.is_some() && current == previous {
            debug!(fingerprint = ?current, "Emission factors unchanged, skipping reload");
            return false;
        }

        let loaded = self.load();
        info!(providers = loaded, fingerprint = ?current, "Reloaded emission factors");
        true
    }

    /// Providers whose factors are currently loaded
    pub fn loaded_providers(&self) -> Vec<Provider> {
        let factors = self.factors.read().unwrap_or_else(|e| e.into_inner());
        let mut providers: Vec<Provider> = factors.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }

    /// Fingerprint of the dataset the tables were loaded from
    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Annotate an instance with its emissions over `interval`.
    ///
    /// Missing factors for the instance's provider, region or kind fail the
    /// whole instance. Per-metric failures are reported in the outcomes and
    /// leave that metric without an emission value.
    pub fn calculate(
        &self,
        mut instance: Instance,
        interval: Duration,
    ) -> Result<CalculationReport, CalcError> {
        let factors = self.factors.read().unwrap_or_else(|e| e.into_inner());
        let provider_factors = factors
            .get(&instance.provider)
            .ok_or(FactorError::ProviderNotLoaded(instance.provider))?;

        let grid = provider_factors.grid(&instance.region)?;
        let model = provider_factors.model(&instance.kind)?;

        let params = Parameters {
            grid_co2e: grid.grid_co2e_grams,
            pue: grid.pue,
            curve: &model.curve,
            vcpu: model.vcpu,
        };

        let samples: Vec<_> = instance.metrics.iter().cloned().collect();
        let mut outcomes = Vec::with_capacity(samples.len());

        for mut metric in samples {
            let kind = metric.kind;
            match operational_emissions(&metric, &params, interval) {
                Ok(grams) => {
                    metric.emissions = Some(ResourceEmission::grams(grams));
                    instance.metrics.upsert(metric);
                    outcomes.push((kind, MetricOutcome::Calculated(grams)));
                }
                Err(CalcError::NotImplemented(_)) => {
                    debug!(
                        instance_id = %instance.id,
                        metric = %kind,
                        "Metric kind not implemented, skipping"
                    );
                    outcomes.push((kind, MetricOutcome::NotImplemented));
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        metric = %kind,
                        error = %e,
                        "Failed calculating operational emissions"
                    );
                    self.metrics.inc_calculation_errors(e.reason());
                    outcomes.push((kind, MetricOutcome::Failed(e)));
                }
            }
        }

        instance.embodied_emissions = Some(ResourceEmission::grams(embodied_emissions(
            interval,
            model.hourly_embodied,
        )));

        Ok(CalculationReport {
            instance,
            tier: model.tier,
            outcomes,
        })
    }
}

impl EventHandler for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn handle(&self, event: &Event, bus: &EventBus) -> Result<()> {
        let collected = match event {
            Event::MetricsCollected(e) => e,
            other => {
                warn!(topic = %other.topic(), "Calculator received an unexpected event, dropping");
                return Ok(());
            }
        };

        match self.calculate(collected.instance.clone(), collected.interval) {
            Ok(report) => {
                debug!(
                    instance_id = %report.instance.id,
                    tier = ?report.tier,
                    "Calculated instance emissions"
                );
                bus.publish(Event::emissions_calculated(
                    report.instance,
                    collected.interval,
                ));
                if let Some(health) = &self.health {
                    health.record(components::CALCULATOR, ComponentHealth::healthy());
                }
            }
            Err(e) => {
                error!(
                    instance_id = %collected.instance.id,
                    provider = %collected.instance.provider,
                    region = %collected.instance.region,
                    kind = %collected.instance.kind,
                    error = %e,
                    "Skipping instance, emission factors unavailable"
                );
                self.metrics.inc_calculation_errors(e.reason());
                if let Some(health) = &self.health {
                    health.record(
                        components::CALCULATOR,
                        ComponentHealth::degraded(format!(
                            "{} skipped: {}",
                            collected.instance.id, e
                        )),
                    );
                }
            }
        }

        Ok(())
    }

    fn stop(&self) {
        info!("Stopping calculator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::factors::{EmbodiedSpecs, EmissionFactors, InstanceData, MemoryStore, Wattage};
    use crate::models::Metric;
    use std::sync::Mutex;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn gcp_factors() -> EmissionFactors {
        let mut factors = EmissionFactors {
            average_pue: 1.2,
            ..Default::default()
        };
        // 100 g/kWh once converted
        factors.coefficient.insert("europe-west1".to_string(), 0.0001);
        factors.embodied.insert(
            "e2-standard-4".to_string(),
            EmbodiedSpecs {
                min_watts: 10.0,
                max_watts: 100.0,
                total_embodied_kwh_co2e: 5256.0,
                vcpu: 4.0,
                total_vcpu: 48.0,
            },
        );
        factors
    }

    fn gcp_instances() -> HashMap<String, InstanceData> {
        let mut instances = HashMap::new();
        instances.insert(
            "n2-standard-8".to_string(),
            InstanceData {
                vcpu: 8,
                pkg_watt: vec![
                    Wattage {
                        percentage: 0.0,
                        wattage: 10.0,
                    },
                    Wattage {
                        percentage: 100.0,
                        wattage: 100.0,
                    },
                ],
                embodied_hourly_gco2e: 12.0,
            },
        );
        instances
    }

    fn calculator() -> Calculator {
        let store = MemoryStore::new()
            .with_factors(Provider::Gcp, gcp_factors())
            .with_instances(Provider::Gcp, gcp_instances());
        Calculator::new(Arc::new(store), &[Provider::Gcp, Provider::Aws])
    }

    fn instance(region: &str, kind: &str) -> Instance {
        Instance::new("vm-1", Provider::Gcp, region, kind)
            .with_name("web")
            .with_metric(Metric::new(MetricKind::Cpu, 50.0, 4.0))
            .with_metric(Metric::new(MetricKind::Memory, 70.0, 16.0))
    }

    struct Sink(Mutex<Vec<Instance>>);

    impl EventHandler for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        fn handle(&self, event: &Event, _bus: &EventBus) -> Result<()> {
            self.0.lock().unwrap().push(event.instance().clone());
            Ok(())
        }
    }

    fn wired() -> (EventBus, Arc<Sink>) {
        let bus = EventBus::new();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        bus.subscribe(Topic::MetricsCollected, Arc::new(calculator()));
        bus.subscribe(Topic::EmissionsCalculated, sink.clone());
        (bus, sink)
    }

    #[test]
    fn test_only_configured_providers_loaded() {
        assert_eq!(calculator().loaded_providers(), vec![Provider::Gcp]);
    }

    #[test]
    fn test_fallback_calculation() {
        let report = calculator()
            .calculate(instance("europe-west1", "e2-standard-4"), FIVE_MINUTES)
            .unwrap();

        assert_eq!(report.tier, ModelTier::Fallback);
        let cpu = report.instance.metrics.get(MetricKind::Cpu).unwrap();
        assert!((cpu.emissions.unwrap().value - 2.2).abs() < 1e-9);
        assert!(matches!(
            report.outcome(MetricKind::Cpu),
            Some(MetricOutcome::Calculated(_))
        ));

        // 5256 / 8760 / 6 * (4 / 48) = 0.00833 g per hour, over 5 minutes
        let hourly = 5256.0 / 8760.0 / 6.0 * (4.0 / 48.0);
        let embodied = report.instance.embodied_emissions.unwrap().value;
        assert!((embodied - hourly / 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_precise_calculation_uses_dataset_vcpu() {
        let report = calculator()
            .calculate(instance("europe-west1", "n2-standard-8"), FIVE_MINUTES)
            .unwrap();

        assert_eq!(report.tier, ModelTier::Precise);
        let cpu = report.instance.metrics.get(MetricKind::Cpu).unwrap();
        assert!((cpu.emissions.unwrap().value - 4.4).abs() < 1e-9);
        assert!((report.instance.embodied_emissions.unwrap().value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unsupported_metrics_left_unannotated() {
        let report = calculator()
            .calculate(instance("europe-west1", "e2-standard-4"), FIVE_MINUTES)
            .unwrap();

        assert!(matches!(
            report.outcome(MetricKind::Memory),
            Some(MetricOutcome::NotImplemented)
        ));
        let memory = report.instance.metrics.get(MetricKind::Memory).unwrap();
        assert!(memory.emissions.is_none());
        assert_eq!(report.instance.metrics.len(), 2);
    }

    #[test]
    fn test_zero_vcpu_metric_fails_alone() {
        let mut input = instance("europe-west1", "e2-standard-4");
        input.metrics.upsert(Metric::new(MetricKind::Cpu, 50.0, 0.0));

        let report = calculator().calculate(input, FIVE_MINUTES).unwrap();

        assert!(matches!(
            report.outcome(MetricKind::Cpu),
            Some(MetricOutcome::Failed(CalcError::ZeroVcpu))
        ));
        assert!(report.instance.embodied_emissions.is_some());
    }

    #[test]
    fn test_missing_region_fails_instance() {
        let err = calculator()
            .calculate(instance("mars-north1", "e2-standard-4"), FIVE_MINUTES)
            .unwrap_err();
        assert!(matches!(
            err,
            CalcError::Factors(FactorError::RegionNotFound { .. })
        ));
    }

    #[test]
    fn test_unloaded_provider_fails_instance() {
        let mut input = instance("us-east-1", "t3.micro");
        input.provider = Provider::Aws;

        let err = calculator().calculate(input, FIVE_MINUTES).unwrap_err();
        assert_eq!(err.reason(), "provider_not_loaded");
    }

    #[test]
    fn test_event_flow_publishes_annotated_instance() {
        let (bus, sink) = wired();

        bus.publish(Event::metrics_collected(
            instance("europe-west1", "e2-standard-4"),
            FIVE_MINUTES,
        ));

        let received = sink.0.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].embodied_emissions.is_some());
        assert!(received[0]
            .metrics
            .get(MetricKind::Cpu)
            .unwrap()
            .emissions
            .is_some());
    }

    #[test]
    fn test_missing_region_publishes_nothing() {
        let (bus, sink) = wired();

        let delivered = bus.publish(Event::metrics_collected(
            instance("mars-north1", "e2-standard-4"),
            FIVE_MINUTES,
        ));

        assert_eq!(delivered, 1);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unexpected_event_dropped() {
        let bus = EventBus::new();
        let calculator = calculator();

        let result = calculator.handle(
            &Event::emissions_calculated(instance("europe-west1", "e2-standard-4"), FIVE_MINUTES),
            &bus,
        );

        assert!(result.is_ok());
    }

    #[test]
    fn test_reload_without_fingerprint_always_refreshes() {
        let calculator = calculator();
        assert!(calculator.fingerprint().is_none());
        assert!(calculator.reload());
        assert_eq!(calculator.loaded_providers(), vec![Provider::Gcp]);
    }

    #[test]
    fn test_reload_skips_unchanged_dataset() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("v1")).unwrap();
        std::fs::write(
            dir.path().join("v1").join("gcp.json"),
            serde_json::to_string(&gcp_factors()).unwrap(),
        )
        .unwrap();

        let store = Arc::new(crate::factors::DatasetStore::new(dir.path()));
        let calculator = Calculator::new(store, &[Provider::Gcp]);
        assert!(calculator.fingerprint().is_some());
        assert!(!calculator.reload());

        let mut changed = gcp_factors();
        changed.coefficient.insert("us-central1".to_string(), 0.0004);
        std::fs::write(
            dir.path().join("v1").join("gcp.json"),
            serde_json::to_string(&changed).unwrap(),
        )
        .unwrap();
        assert!(calculator.reload());

        let report = calculator
            .calculate(instance("us-central1", "e2-standard-4"), FIVE_MINUTES)
            .unwrap();
        assert_eq!(report.tier, ModelTier::Fallback);
    }

    fn dataset_dir(v1: &str) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("v1")).unwrap();
        std::fs::create_dir_all(dir.path().join("v2")).unwrap();
        std::fs::write(dir.path().join("v1").join("gcp.json"), v1).unwrap();
        dir
    }

    #[test]
    fn test_corrupt_instance_dataset_falls_back() {
        let dir = dataset_dir(&serde_json::to_string(&gcp_factors()).unwrap());
        std::fs::write(dir.path().join("v2").join("gcp-instances.json"), "{ not json").unwrap();

        let store = Arc::new(crate::factors::DatasetStore::new(dir.path()));
        let calculator = Calculator::new(store, &[Provider::Gcp]);

        assert_eq!(calculator.loaded_providers(), vec![Provider::Gcp]);
        let report = calculator
            .calculate(instance("europe-west1", "e2-standard-4"), FIVE_MINUTES)
            .unwrap();
        assert_eq!(report.tier, ModelTier::Fallback);
        let cpu = report.instance.metrics.get(MetricKind::Cpu).unwrap();
        assert!((cpu.emissions.unwrap().value - 2.2).abs() < 1e-9);
    }

    #[test]
    fn test_failed_reload_keeps_previous_tables() {
        let dir = dataset_dir(&serde_json::to_string(&gcp_factors()).unwrap());
        let store = Arc::new(crate::factors::DatasetStore::new(dir.path()));
        let calculator = Calculator::new(store, &[Provider::Gcp]);
        let loaded_fingerprint = calculator.fingerprint();

        std::fs::write(dir.path().join("v1").join("gcp.json"), "{ \"average_pue\": ").unwrap();
        calculator.reload();

        assert_eq!(calculator.loaded_providers(), vec![Provider::Gcp]);
        assert_eq!(calculator.fingerprint(), loaded_fingerprint);
        assert!(calculator
            .calculate(instance("europe-west1", "e2-standard-4"), FIVE_MINUTES)
            .is_ok());

        // Once the file is fixed the next reload picks it up.
        let mut fixed = gcp_factors();
        fixed.coefficient.insert("us-central1".to_string(), 0.0004);
        std::fs::write(
            dir.path().join("v1").join("gcp.json"),
            serde_json::to_string(&fixed).unwrap(),
        )
        .unwrap();
        assert!(calculator.reload());
        assert_ne!(calculator.fingerprint(), loaded_fingerprint);
        assert!(calculator
            .calculate(instance("us-central1", "e2-standard-4"), FIVE_MINUTES)
            .is_ok());
    }

    #[test]
    fn test_health_tracks_skipped_instances() {
        use crate::health::ComponentStatus;

        let health = HealthRegistry::new();
        let bus = EventBus::new();
        bus.subscribe(
            Topic::MetricsCollected,
            Arc::new(calculator().with_health(health.clone())),
        );

        bus.publish(Event::metrics_collected(
            instance("mars-north1", "e2-standard-4"),
            FIVE_MINUTES,
        ));
        let degraded = tokio_test::block_on(health.component(components::CALCULATOR)).unwrap();
        assert_eq!(degraded.status, ComponentStatus::Degraded);
        assert!(degraded.message.unwrap().starts_with("vm-1 skipped"));

        bus.publish(Event::metrics_collected(
            instance("europe-west1", "e2-standard-4"),
            FIVE_MINUTES,
        ));
        let recovered = tokio_test::block_on(health.component(components::CALCULATOR)).unwrap();
        assert_eq!(recovered.status, ComponentStatus::Healthy);
    }
}
