//! Emission factor resolution for a single instance

use super::{EmbodiedSpecs, EmissionFactors, FactorError, InstanceData};
use crate::calculator::{CurveOrigin, WattageCurve};
use crate::models::Provider;
use std::collections::HashMap;

/// Server lifespan used to amortize embodied emissions.
/// AWS, GCP and Azure extended their server lifespan to 6 years in 2024.
pub const SERVER_LIFESPAN_YEARS: f64 = 6.0;

/// Grid intensity in the dataset is in metric tons, calculations use grams
pub const TONS_TO_GRAMS: f64 = 1_000_000.0;

/// Region-level factors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFactors {
    /// Grid carbon intensity in grams CO2e per kWh
    pub grid_co2e_grams: f64,
    pub pue: f64,
}

/// Which data an instance kind's model was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Per-kind entry of the instance dataset
    Precise,
    /// Min/max watts and embodied totals of the factor table
    Fallback,
}

/// Power and embodied model for an instance kind
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub tier: ModelTier,
    pub curve: WattageCurve,
    /// vCPU count from the dataset, when it provides one
    pub vcpu: Option<f64>,
    /// Embodied emissions per hour in grams CO2e
    pub hourly_embodied: f64,
}

/// Grid intensity (converted to grams) and PUE for a region
pub fn grid_factors(
    provider: Provider,
    factors: &EmissionFactors,
    region: &str,
) -> Result<GridFactors, FactorError> {
    let tons = factors
        .coefficient
        .get(region)
        .ok_or_else(|| FactorError::RegionNotFound {
            provider,
            region: region.to_string(),
        })?;

    Ok(GridFactors {
        grid_co2e_grams: tons * TONS_TO_GRAMS,
        pue: factors.average_pue,
    })
}

/// Resolve the power and embodied model for an instance kind.
///
/// The precise dataset wins when it has an entry for the kind, otherwise a
/// two-point curve and an amortized embodied factor are derived from the
/// factor table's specs.
pub fn resolve_model(
    provider: Provider,
    factors: &EmissionFactors,
    instances: &HashMap<String, InstanceData>,
    kind: &str,
) -> Result<ResolvedModel, FactorError> {
    if let Some(data) = instances.get(kind) {
        let curve = WattageCurve::new(&data.pkg_watt, CurveOrigin::Precise).map_err(|source| {
            FactorError::Curve {
                kind: kind.to_string(),
                source,
            }
        })?;
        return Ok(ResolvedModel {
            tier: ModelTier::Precise,
            curve,
            vcpu: (data.vcpu > 0).then_some(f64::from(data.vcpu)),
            hourly_embodied: data.embodied_hourly_gco2e,
        });
    }

    let specs = factors
        .embodied
        .get(kind)
        .ok_or_else(|| FactorError::KindNotFound {
            provider,
            kind: kind.to_string(),
        })?;

    if specs.total_vcpu <= 0.0 {
        return Err(FactorError::InvalidSpecs {
            kind: kind.to_string(),
            reason: "platform total vCPU must be positive".to_string(),
        });
    }

    let curve =
        WattageCurve::min_max(specs.min_watts, specs.max_watts).map_err(|source| {
            FactorError::Curve {
                kind: kind.to_string(),
                source,
            }
        })?;

    Ok(ResolvedModel {
        tier: ModelTier::Fallback,
        curve,
        vcpu: None,
        hourly_embodied: hourly_embodied_emissions(specs),
    })
}

/// Amortize a kind's total embodied emissions to one hour of its vCPU share.
///
/// M = TE * (TR / EL) * (RR / TR): total embodied emissions, times one hour
/// over the expected lifespan, times reserved vCPUs over platform vCPUs.
pub fn hourly_embodied_emissions(specs: &EmbodiedSpecs) -> f64 {
    specs.total_embodied_kwh_co2e
        * ((1.0 / 24.0 / 365.0) / SERVER_LIFESPAN_YEARS)
        * (specs.vcpu / specs.total_vcpu)
}

/// Factor tables of one provider, as loaded at engine start
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFactors {
    pub provider: Provider,
    pub factors: EmissionFactors,
    pub instances: HashMap<String, InstanceData>,
}

impl ProviderFactors {
    pub fn grid(&self, region: &str) -> Result<GridFactors, FactorError> {
        grid_factors(self.provider, &self.factors, region)
    }

    pub fn model(&self, kind: &str) -> Result<ResolvedModel, FactorError> {
        resolve_model(self.provider, &self.factors, &self.instances, kind)
    }
}
