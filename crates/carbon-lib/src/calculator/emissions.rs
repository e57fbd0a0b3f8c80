//! Operational and embodied emission formulas

use super::{CalcError, WattageCurve};
use crate::models::{Metric, MetricKind};
use std::time::Duration;
use tracing::debug;

/// Resolved inputs for one instance's calculation
#[derive(Debug, Clone, Copy)]
pub struct Parameters<'a> {
    /// Grid carbon intensity in grams CO2e per kWh
    pub grid_co2e: f64,
    pub pue: f64,
    pub curve: &'a WattageCurve,
    /// vCPU count from the dataset; the metric's unit amount is used when absent
    pub vcpu: Option<f64>,
}

/// Operational emissions in grams CO2e of one metric over `interval`
pub fn operational_emissions(
    metric: &Metric,
    params: &Parameters<'_>,
    interval: Duration,
) -> Result<f64, CalcError> {
    match metric.kind {
        MetricKind::Cpu => cpu(metric, params, interval),
        kind @ (MetricKind::Memory | MetricKind::Storage | MetricKind::Network) => {
            Err(CalcError::NotImplemented(kind))
        }
    }
}

/// CPU operational emissions.
///
/// Power at the sampled utilization comes from the wattage curve, scaled by
/// vCPU hours in the interval, PUE, and the regional grid intensity.
pub fn cpu(metric: &Metric, params: &Parameters<'_>, interval: Duration) -> Result<f64, CalcError> {
    let vcpu = match params.vcpu {
        Some(v) if v > 0.0 => v,
        _ if metric.unit_amount > 0.0 => metric.unit_amount,
        _ => return Err(CalcError::ZeroVcpu),
    };

    // e.g. 4 vCPUs over 5 minutes: 5 / 60 * 4 = 0.333 vCPU hours
    let vcpu_hours = interval_minutes(interval) / 60.0 * vcpu;

    let usage_kw = params.curve.kilowatts_at(metric.usage)?;

    debug!(
        usage_kw,
        vcpu_hours,
        pue = params.pue,
        grid_co2e = params.grid_co2e,
        "CPU calculation"
    );

    Ok(usage_kw * vcpu_hours * params.pue * params.grid_co2e)
}

/// Embodied emissions in grams CO2e attributable to `interval`
pub fn embodied_emissions(interval: Duration, hourly_embodied: f64) -> f64 {
    hourly_embodied / 60.0 * interval_minutes(interval)
}

fn interval_minutes(interval: Duration) -> f64 {
    interval.as_secs_f64() / 60.0
}
