//! Observability infrastructure for the carbon agent
//!
//! Provides:
//! - Prometheus metrics (collection latency, error counters, emissions gauges)
//! - Structured JSON logging with tracing
//! - A bus handler that records calculated emissions

use crate::bus::{Event, EventBus, EventHandler};
use crate::cache::CachedResource;
use crate::models::{Instance, MetricKind};
use anyhow::Result;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    GaugeVec, Histogram, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for collection latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<CarbonMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct CarbonMetricsInner {
    collection_latency_seconds: Histogram,
    instances_collected: IntCounter,
    collection_errors: IntCounterVec,
    calculation_errors: IntCounterVec,
    events_published: IntCounterVec,
    handler_failures: IntCounterVec,
    operational_emissions: GaugeVec,
    embodied_emissions: GaugeVec,
}

impl CarbonMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "carbon_agent_collection_latency_seconds",
                "Time spent collecting instance metrics from a provider",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            instances_collected: register_int_counter!(
                "carbon_agent_instances_collected_total",
                "Total number of instance samples collected"
            )
            .expect("Failed to register instances_collected"),

            collection_errors: register_int_counter_vec!(
                "carbon_agent_collection_errors_total",
                "Total number of failed or timed out collection passes",
                &["account"]
            )
            .expect("Failed to register collection_errors"),

            calculation_errors: register_int_counter_vec!(
                "carbon_agent_calculation_errors_total",
                "Total number of instances or metrics skipped by the calculator",
                &["reason"]
            )
            .expect("Failed to register calculation_errors"),

            events_published: register_int_counter_vec!(
                "carbon_agent_events_published_total",
                "Total number of events published on the bus",
                &["topic"]
            )
            .expect("Failed to register events_published"),

            handler_failures: register_int_counter_vec!(
                "carbon_agent_handler_failures_total",
                "Total number of event handler invocations that failed",
                &["handler"]
            )
            .expect("Failed to register handler_failures"),

            operational_emissions: register_gauge_vec!(
                "carbon_agent_operational_emissions_grams",
                "Operational emissions of the last interval in grams CO2e",
                &["provider", "region", "instance", "kind", "metric"]
            )
            .expect("Failed to register operational_emissions"),

            embodied_emissions: register_gauge_vec!(
                "carbon_agent_embodied_emissions_grams",
                "Embodied emissions of the last interval in grams CO2e",
                &["provider", "region", "instance", "kind"]
            )
            .expect("Failed to register embodied_emissions"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct CarbonMetrics {
    _private: (),
}

impl Default for CarbonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CarbonMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CarbonMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CarbonMetricsInner {
        GLOBAL_METRICS.get_or_init(CarbonMetricsInner::new)
    }

    /// Record a collection latency observation
    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn add_instances_collected(&self, count: u64) {
        self.inner().instances_collected.inc_by(count);
    }

    pub fn inc_collection_errors(&self, account: &str) {
        self.inner()
            .collection_errors
            .with_label_values(&[account])
            .inc();
    }

    pub fn inc_calculation_errors(&self, reason: &str) {
        self.inner()
            .calculation_errors
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_events_published(&self, topic: &str) {
        self.inner()
            .events_published
            .with_label_values(&[topic])
            .inc();
    }

    pub fn inc_handler_failures(&self, handler: &str) {
        self.inner()
            .handler_failures
            .with_label_values(&[handler])
            .inc();
    }

    /// Publish the emissions attached to an annotated instance
    pub fn record_emissions(&self, instance: &Instance) {
        let provider = instance.provider.as_str();
        for metric in instance.metrics.iter() {
            if let Some(emissions) = metric.emissions {
                self.inner()
                    .operational_emissions
                    .with_label_values(&[
                        provider,
                        instance.region.as_str(),
                        instance.id.as_str(),
                        instance.kind.as_str(),
                        metric.kind.as_str(),
                    ])
                    .set(emissions.value);
            }
        }
        if let Some(embodied) = instance.embodied_emissions {
            self.inner()
                .embodied_emissions
                .with_label_values(&[
                    provider,
                    instance.region.as_str(),
                    instance.id.as_str(),
                    instance.kind.as_str(),
                ])
                .set(embodied.value);
        }
    }

    /// Drop the emissions series of a resource that left the cache
    pub fn forget_instance(&self, resource: &CachedResource) {
        let labels = [
            resource.provider.as_str(),
            resource.region.as_str(),
            resource.id.as_str(),
            resource.kind.as_str(),
        ];
        // Series that were never recorded are not an error
        for metric in MetricKind::ALL {
            let [provider, region, id, kind] = labels;
            let _ = self
                .inner()
                .operational_emissions
                .remove_label_values(&[provider, region, id, kind, metric.as_str()]);
        }
        let _ = self.inner().embodied_emissions.remove_label_values(&labels);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for emissions results
/// and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    agent_name: String,
}

impl StructuredLogger {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }

    /// Log the emissions attached to an instance
    pub fn log_emissions(&self, instance: &Instance) {
        let cpu_grams = instance
            .metrics
            .get(MetricKind::Cpu)
            .and_then(|m| m.emissions)
            .map(|e| e.value);
        let embodied_grams = instance.embodied_emissions.map(|e| e.value);

        info!(
            event = "emissions_calculated",
            agent = %self.agent_name,
            provider = %instance.provider,
            region = %instance.region,
            instance_id = %instance.id,
            instance_name = %instance.name,
            kind = %instance.kind,
            cpu_grams = ?cpu_grams,
            embodied_grams = ?embodied_grams,
            "Calculated instance emissions"
        );
    }

    /// Log a collection pass that was abandoned
    pub fn log_collection_failure(&self, account: &str, reason: &str) {
        warn!(
            event = "collection_failed",
            agent = %self.agent_name,
            account = %account,
            reason = %reason,
            "Collection pass abandoned, retrying next tick"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, schedulers: usize) {
        info!(
            event = "agent_started",
            agent = %self.agent_name,
            agent_version = %version,
            schedulers = schedulers,
            "Carbon agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.agent_name,
            reason = %reason,
            "Carbon agent shutting down"
        );
    }
}

/// Bus handler recording every calculated instance in logs and metrics
pub struct EmissionsReporter {
    logger: StructuredLogger,
    metrics: CarbonMetrics,
}

impl EmissionsReporter {
    pub fn new(logger: StructuredLogger, metrics: CarbonMetrics) -> Self {
        Self { logger, metrics }
    }
}

impl EventHandler for EmissionsReporter {
    fn name(&self) -> &str {
        "emissions_reporter"
    }

    fn handle(&self, event: &Event, _bus: &EventBus) -> Result<()> {
        match event {
            Event::EmissionsCalculated(e) => {
                self.logger.log_emissions(&e.instance);
                self.metrics.record_emissions(&e.instance);
            }
            Event::MetricsCollected(e) => {
                warn!(
                    instance_id = %e.instance.id,
                    "Reporter received an uncalculated instance, dropping"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::models::{Metric, Provider, ResourceEmission};
    use std::sync::Arc;
    use std::time::Duration;

    fn annotated_instance() -> Instance {
        let mut metric = Metric::new(MetricKind::Cpu, 50.0, 4.0);
        metric.emissions = Some(ResourceEmission::grams(2.2));
        let mut instance = Instance::new("i-obs", Provider::Aws, "eu-west-1", "t3.micro")
            .with_metric(metric);
        instance.embodied_emissions = Some(ResourceEmission::grams(0.4));
        instance
    }

    #[test]
    fn test_carbon_metrics_record() {
        let metrics = CarbonMetrics::new();

        metrics.observe_collection_latency(0.2);
        metrics.add_instances_collected(3);
        metrics.inc_collection_errors("acct");
        metrics.inc_calculation_errors("region_not_found");
        metrics.inc_handler_failures("test");
        metrics.record_emissions(&annotated_instance());

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "carbon_agent_operational_emissions_grams"));
    }

    fn series_for(name: &str, instance: &str) -> usize {
        prometheus::gather()
            .iter()
            .filter(|f| f.get_name() == name)
            .flat_map(|f| f.get_metric().iter())
            .filter(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "instance" && l.get_value() == instance)
            })
            .count()
    }

    #[test]
    fn test_forget_instance_removes_series() {
        let metrics = CarbonMetrics::new();
        let mut instance = annotated_instance();
        instance.id = "i-gone".to_string();
        metrics.record_emissions(&instance);
        assert_eq!(
            series_for("carbon_agent_operational_emissions_grams", "i-gone"),
            1
        );
        assert_eq!(series_for("carbon_agent_embodied_emissions_grams", "i-gone"), 1);

        metrics.forget_instance(&CachedResource {
            id: "i-gone".to_string(),
            provider: Provider::Aws,
            region: "eu-west-1".to_string(),
            service: String::new(),
            kind: "t3.micro".to_string(),
            name: String::new(),
            vcpu: 1,
            lifecycle: String::new(),
        });

        assert_eq!(
            series_for("carbon_agent_operational_emissions_grams", "i-gone"),
            0
        );
        assert_eq!(series_for("carbon_agent_embodied_emissions_grams", "i-gone"), 0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-agent");
        assert_eq!(logger.agent_name, "test-agent");
    }

    #[test]
    fn test_reporter_accepts_calculated_events() {
        let bus = EventBus::new();
        let reporter = Arc::new(EmissionsReporter::new(
            StructuredLogger::new("test-agent"),
            CarbonMetrics::new(),
        ));
        bus.subscribe(Topic::EmissionsCalculated, reporter);

        let delivered = bus.publish(Event::emissions_calculated(
            annotated_instance(),
            Duration::from_secs(300),
        ));

        assert_eq!(delivered, 1);
    }
}
