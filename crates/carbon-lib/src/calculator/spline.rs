//! Utilization -> power curves
//!
//! A natural cubic spline is fitted through the control points of a
//! [`WattageCurve`]: second derivatives are zero at both ends and the curve
//! passes exactly through every control point. Utilization outside the
//! control points' range is clamped to the nearest end point, so bursting
//! above 100% reports the power measured at the top of the curve.

use crate::factors::Wattage;
use thiserror::Error;

/// Errors raised when building or evaluating a curve
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CurveError {
    #[error("cannot calculate power, wattage curve has no control points")]
    Empty,

    #[error("wattage curve has more than one control point at {0}%")]
    DuplicatePercentage(f64),

    #[error("wattage curve contains a non-finite value")]
    NonFinite,
}

/// Where a curve's control points came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveOrigin {
    /// Measured multi-point curve from the instance dataset
    Precise,
    /// Two-point min/max curve derived from hardware specs
    Degraded,
}

/// Immutable set of (utilization %, watts) control points with a fitted spline
#[derive(Debug, Clone, PartialEq)]
pub struct WattageCurve {
    percentages: Vec<f64>,
    watts: Vec<f64>,
    /// Second derivative of the spline at each control point
    second_derivs: Vec<f64>,
    origin: CurveOrigin,
}

impl WattageCurve {
    /// Build a curve from control points in any order
    pub fn new(points: &[Wattage], origin: CurveOrigin) -> Result<Self, CurveError> {
        if points
            .iter()
            .any(|p| !p.percentage.is_finite() || !p.wattage.is_finite())
        {
            return Err(CurveError::NonFinite);
        }

        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.percentage.total_cmp(&b.percentage));
        if let Some(pair) = sorted.windows(2).find(|w| w[0].percentage == w[1].percentage) {
            return Err(CurveError::DuplicatePercentage(pair[0].percentage));
        }

        let percentages: Vec<f64> = sorted.iter().map(|p| p.percentage).collect();
        let watts: Vec<f64> = sorted.iter().map(|p| p.wattage).collect();
        let second_derivs = natural_second_derivatives(&percentages, &watts);

        Ok(Self {
            percentages,
            watts,
            second_derivs,
            origin,
        })
    }

    /// Two-point curve spanning idle (0%) to full load (100%)
    pub fn min_max(min_watts: f64, max_watts: f64) -> Result<Self, CurveError> {
        Self::new(
            &[
                Wattage {
                    percentage: 0.0,
                    wattage: min_watts,
                },
                Wattage {
                    percentage: 100.0,
                    wattage: max_watts,
                },
            ],
            CurveOrigin::Degraded,
        )
    }

    pub fn origin(&self) -> CurveOrigin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.percentages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.percentages.is_empty()
    }

    /// Power draw in watts at `usage` percent
    pub fn watts_at(&self, usage: f64) -> Result<f64, CurveError> {
        let n = self.percentages.len();
        if n == 0 {
            return Err(CurveError::Empty);
        }
        if !usage.is_finite() {
            return Err(CurveError::NonFinite);
        }
        if n == 1 || usage <= self.percentages[0] {
            return Ok(self.watts[0]);
        }
        if usage >= self.percentages[n - 1] {
            return Ok(self.watts[n - 1]);
        }

        // Index of the segment [x_i, x_i+1] containing usage
        let i = self.percentages.partition_point(|&x| x <= usage) - 1;
        let (x0, x1) = (self.percentages[i], self.percentages[i + 1]);
        let (y0, y1) = (self.watts[i], self.watts[i + 1]);
        let (m0, m1) = (self.second_derivs[i], self.second_derivs[i + 1]);

        let h = x1 - x0;
        let a = (x1 - usage) / h;
        let b = (usage - x0) / h;

        Ok(a * y0 + b * y1 + ((a * a * a - a) * m0 + (b * b * b - b) * m1) * h * h / 6.0)
    }

    /// Power draw in kilowatts at `usage` percent
    pub fn kilowatts_at(&self, usage: f64) -> Result<f64, CurveError> {
        Ok(self.watts_at(usage)? / 1000.0)
    }
}

/// Solve the tridiagonal system for a natural spline's second derivatives
fn natural_second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut m = vec![0.0; n];
    if n < 3 {
        return m;
    }

    // Thomas algorithm over the interior points 1..n-1
    let interior = n - 2;
    let mut c_prime = vec![0.0; interior];
    let mut d_prime = vec![0.0; interior];

    for k in 0..interior {
        let i = k + 1;
        let h_prev = x[i] - x[i - 1];
        let h_next = x[i + 1] - x[i];
        let diag = 2.0 * (h_prev + h_next);
        let rhs = 6.0 * ((y[i + 1] - y[i]) / h_next - (y[i] - y[i - 1]) / h_prev);

        if k == 0 {
            c_prime[k] = h_next / diag;
            d_prime[k] = rhs / diag;
        } else {
            let denom = diag - h_prev * c_prime[k - 1];
            c_prime[k] = h_next / denom;
            d_prime[k] = (rhs - h_prev * d_prime[k - 1]) / denom;
        }
    }

    for k in (0..interior).rev() {
        let next = if k + 1 < interior { m[k + 2] } else { 0.0 };
        m[k + 1] = d_prime[k] - c_prime[k] * next;
    }

    m
}

/// Fit a curve through `points` and return kilowatts at `usage` percent
pub fn cubic_spline_kw(points: &[Wattage], usage: f64) -> Result<f64, CurveError> {
    WattageCurve::new(points, CurveOrigin::Precise)?.kilowatts_at(usage)
}
