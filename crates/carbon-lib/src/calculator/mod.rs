//! Emissions calculation engine
//!
//! Converts utilization samples into operational emissions using a power
//! curve, grid intensity and PUE, and attributes amortized embodied
//! emissions to each instance.

mod emissions;
mod engine;
mod spline;

pub use emissions::{cpu, embodied_emissions, operational_emissions, Parameters};
pub use engine::{CalculationReport, Calculator, MetricOutcome};
pub use spline::{cubic_spline_kw, CurveError, CurveOrigin, WattageCurve};

use crate::factors::FactorError;
use crate::models::MetricKind;
use thiserror::Error;

/// Errors raised while calculating emissions
#[derive(Debug, Error)]
pub enum CalcError {
    #[error("{0} emissions are not yet being calculated")]
    NotImplemented(MetricKind),

    #[error("vCPU count is zero for both the dataset and the metric")]
    ZeroVcpu,

    #[error(transparent)]
    Curve(#[from] CurveError),

    #[error(transparent)]
    Factors(#[from] FactorError),
}

impl CalcError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            CalcError::NotImplemented(_) => "not_implemented",
            CalcError::ZeroVcpu => "zero_vcpu",
            CalcError::Curve(_) => "invalid_curve",
            CalcError::Factors(e) => e.reason(),
        }
    }
}
