//! Emission factor data and resolution
//!
//! Factors are loaded once per provider from a dataset on disk and then
//! resolved per instance: grid intensity and PUE by region, and a power and
//! embodied model by instance kind.

mod resolver;
mod store;

pub use resolver::{
    grid_factors, hourly_embodied_emissions, resolve_model, GridFactors, ModelTier,
    ProviderFactors, ResolvedModel, SERVER_LIFESPAN_YEARS, TONS_TO_GRAMS,
};
pub use store::{DatasetStore, FactorStore, MemoryStore};

use crate::calculator::CurveError;
use crate::models::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Per-provider emission factors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmissionFactors {
    /// Average power usage effectiveness across the provider's facilities
    pub average_pue: f64,
    /// Region -> grid carbon intensity in metric tons CO2e per kWh
    #[serde(default)]
    pub coefficient: HashMap<String, f64>,
    /// Instance kind -> hardware specs used by the fallback model
    #[serde(default)]
    pub embodied: HashMap<String, EmbodiedSpecs>,
}

/// Hardware specs of an instance kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbodiedSpecs {
    pub min_watts: f64,
    pub max_watts: f64,
    pub total_embodied_kwh_co2e: f64,
    pub vcpu: f64,
    /// vCPUs available on the whole host platform
    pub total_vcpu: f64,
}

/// A measured utilization -> power control point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wattage {
    pub percentage: f64,
    pub wattage: f64,
}

/// Precise per-kind entry from the instance dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    #[serde(default)]
    pub vcpu: u32,
    #[serde(default)]
    pub pkg_watt: Vec<Wattage>,
    #[serde(default)]
    pub embodied_hourly_gco2e: f64,
}

/// Errors raised while loading or resolving emission factors
#[derive(Debug, Error)]
pub enum FactorError {
    #[error("no emission factors loaded for provider {0}")]
    ProviderNotLoaded(Provider),

    #[error("region {region} not found in {provider} emission factors")]
    RegionNotFound { provider: Provider, region: String },

    #[error("instance kind {kind} not found in {provider} emission factors")]
    KindNotFound { provider: Provider, kind: String },

    #[error("invalid specs for instance kind {kind}: {reason}")]
    InvalidSpecs { kind: String, reason: String },

    #[error("invalid wattage curve for instance kind {kind}: {source}")]
    Curve {
        kind: String,
        #[source]
        source: CurveError,
    },

    #[error("failed to read dataset file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dataset file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl FactorError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            FactorError::ProviderNotLoaded(_) => "provider_not_loaded",
            FactorError::RegionNotFound { .. } => "region_not_found",
            FactorError::KindNotFound { .. } => "kind_not_found",
            FactorError::InvalidSpecs { .. } => "invalid_specs",
            FactorError::Curve { .. } => "invalid_curve",
            FactorError::Io { .. } => "dataset_io",
            FactorError::Parse { .. } => "dataset_parse",
        }
    }
}
