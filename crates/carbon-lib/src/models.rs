//! Core data models for the carbon agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cloud provider an instance belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Gcp, Provider::Azure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider '{0}', expected one of aws, gcp, azure")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Kind of utilization sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Storage,
    Network,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Storage,
        MetricKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Storage => "storage",
            MetricKind::Network => "network",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit attached to a computed emission value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmissionUnit {
    #[serde(rename = "gCO2eq")]
    GramsCO2eq,
}

/// Computed emissions for a metric or an instance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEmission {
    pub value: f64,
    pub unit: EmissionUnit,
}

impl ResourceEmission {
    pub fn grams(value: f64) -> Self {
        Self {
            value,
            unit: EmissionUnit::GramsCO2eq,
        }
    }
}

/// One utilization sample for a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    /// Utilization percentage, nominally 0-100
    pub usage: f64,
    /// Amount of the underlying unit, e.g. vCPU count for CPU
    #[serde(default)]
    pub unit_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissions: Option<ResourceEmission>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Metric {
    pub fn new(kind: MetricKind, usage: f64, unit_amount: f64) -> Self {
        Self {
            kind,
            usage,
            unit_amount,
            emissions: None,
            updated_at: Utc::now(),
        }
    }
}

/// Ordered collection holding at most one metric per kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Metric>", into = "Vec<Metric>")]
pub struct Metrics(Vec<Metric>);

impl Metrics {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace the metric of the same kind.
    /// A replaced metric keeps its original position.
    pub fn upsert(&mut self, metric: Metric) {
        match self.0.iter_mut().find(|m| m.kind == metric.kind) {
            Some(existing) => *existing = metric,
            None => self.0.push(metric),
        }
    }

    pub fn get(&self, kind: MetricKind) -> Option<&Metric> {
        self.0.iter().find(|m| m.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Metric>> for Metrics {
    fn from(metrics: Vec<Metric>) -> Self {
        let mut collection = Metrics::new();
        for metric in metrics {
            collection.upsert(metric);
        }
        collection
    }
}

impl From<Metrics> for Vec<Metric> {
    fn from(metrics: Metrics) -> Self {
        metrics.0
    }
}

/// A monitored cloud compute resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider: Provider,
    pub region: String,
    /// Machine type, e.g. `t3.micro` or `n2-standard-4`
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embodied_emissions: Option<ResourceEmission>,
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        provider: Provider,
        region: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            region: region.into(),
            kind: kind.into(),
            name: String::new(),
            service: String::new(),
            metrics: Metrics::new(),
            embodied_emissions: None,
            collected_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.upsert(metric);
        self
    }
}
