//! Point-forecast accuracy metrics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Accuracy of a set of paired (truth, forecast) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Mean Squared Error
    pub mse: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// Mean Absolute Percentage Error (%), absent when a zero truth value
    /// tripped the division guard
    pub mape: Option<f64>,
    /// R², absent on constant truth slices
    pub r2: Option<f64>,
    pub sample_count: usize,
}

/// Zero-denominator policy for MAPE.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MapeGuard {
    pub zero_epsilon: Option<f64>,
}

impl MapeGuard {
    pub fn strict() -> Self {
        Self { zero_epsilon: None }
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self {
            zero_epsilon: Some(epsilon),
        }
    }
}

impl ForecastMetrics {
    pub fn calculate(
        actual: &[f64],
        predicted: &[f64],
        guard: MapeGuard,
    ) -> Result<Self, MetricError> {
        check_dimensions(actual, predicted)?;

        let n = actual.len() as f64;
        let mae = actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).abs())
            .sum::<f64>()
            / n;
        let mse = actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).powi(2))
            .sum::<f64>()
            / n;

        Ok(Self {
            mae,
            mse,
            rmse: mse.sqrt(),
            mape: mape(actual, predicted, guard).ok(),
            r2: r_squared(actual, predicted).ok(),
            sample_count: actual.len(),
        })
    }
}

/// `mean(|a − p| / |a|) × 100`.
pub fn mape(actual: &[f64], predicted: &[f64], guard: MapeGuard) -> Result<f64, MetricError> {
    check_dimensions(actual, predicted)?;
    let mut total = 0.0;
    for (index, (a, p)) in actual.iter().zip(predicted).enumerate() {
        let denominator = match guard.zero_epsilon {
            Some(eps) => a.abs().max(eps),
            None if *a == 0.0 => return Err(MetricError::DivisionGuardTriggered { index }),
            None => a.abs(),
        };
        total += (a - p).abs() / denominator;
    }
    Ok(total / actual.len() as f64 * 100.0)
}

/// `1 − SS_res / SS_tot`.
pub fn r_squared(actual: &[f64], predicted: &[f64]) -> Result<f64, MetricError> {
    check_dimensions(actual, predicted)?;
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    if ss_tot <= f64::EPSILON * mean.abs().max(1.0) {
        return Err(MetricError::ZeroVariance);
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    Ok(1.0 - ss_res / ss_tot)
}

fn check_dimensions(actual: &[f64], predicted: &[f64]) -> Result<(), MetricError> {
    if actual.len() != predicted.len() {
        return Err(MetricError::DimensionMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }
    if actual.is_empty() {
        return Err(MetricError::EmptyData);
    }
    Ok(())
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MAE={:.3}, RMSE={:.3}", self.mae, self.rmse)?;
        match self.mape {
            Some(mape) => write!(f, ", MAPE={mape:.2}%")?,
            None => write!(f, ", MAPE=n/a")?,
        }
        match self.r2 {
            Some(r2) => write!(f, ", R²={r2:.3}"),
            None => write!(f, ", R²=n/a"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,

    #[error("MAPE denominator is zero at index {index}")]
    DivisionGuardTriggered { index: usize },

    #[error("truth values have zero variance")]
    ZeroVariance,
}
