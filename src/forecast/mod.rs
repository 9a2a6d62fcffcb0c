//! The forecaster contract and the four family adapters behind it.
//!
//! Pipelines only see `Forecaster`/`FittedModel` and branch on
//! `Capabilities`; family mechanics stay inside the adapters.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};

use crate::config::{IntervalConfig, ModelsConfig, RuntimeConfig};
use crate::domain::{History, SeriesPoint};
use crate::error::ForecastError;
use crate::ml::FeatureVector;

pub mod additive;
pub mod autoregressive;
pub mod boosted;
pub mod features;
pub mod metrics;
pub mod recurrent;

pub use additive::AdditiveForecaster;
pub use autoregressive::AutoregressiveForecaster;
pub use boosted::BoostedTreeForecaster;
pub use features::{FeatureKind, FeatureProjector, FeatureSpec, ProjectionMode, ProjectionState};
pub use recurrent::RecurrentForecaster;

/// Where a family's bounds come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalSource {
    /// Analytic interval from the fitted model.
    Native,
    /// Separately trained low/high quantile models.
    QuantileTwins,
    /// Symmetric percentage band around the point.
    FixedBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_incremental_update: bool,
    pub supports_direct_multi_horizon: bool,
    pub interval: IntervalSource,
}

impl Capabilities {
    pub fn supports_native_interval(&self) -> bool {
        self.interval == IntervalSource::Native
    }
}

/// Raw model output before bounds are normalised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub point: f64,
    pub interval: Option<(f64, f64)>,
}

impl Estimate {
    pub fn point(point: f64) -> Self {
        Self {
            point,
            interval: None,
        }
    }

    pub fn with_interval(point: f64, lower: f64, upper: f64) -> Self {
        Self {
            point,
            interval: Some((lower, upper)),
        }
    }
}

/// Stored forecast triple: `0 ≤ lower ≤ point ≤ upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Turns estimates into stored predictions: floors at zero, orders the
/// bounds and applies the fixed band for families without their own
/// interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundPolicy {
    pub band_pct: f64,
}

impl BoundPolicy {
    pub fn new(band_pct: f64) -> Self {
        Self { band_pct }
    }

    pub fn resolve(
        &self,
        model: &str,
        capabilities: Capabilities,
        estimate: Estimate,
    ) -> Result<Prediction, ForecastError> {
        if !estimate.point.is_finite() {
            return Err(ForecastError::fit(model, "non-finite point forecast"));
        }
        let point = estimate.point.max(0.0);
        let (lower, upper) = match (capabilities.interval, estimate.interval) {
            (IntervalSource::FixedBand, _) | (_, None) => {
                (point * (1.0 - self.band_pct), point * (1.0 + self.band_pct))
            }
            (_, Some((lo, hi))) if lo.is_finite() && hi.is_finite() => (lo, hi),
            (_, Some(_)) => return Err(ForecastError::fit(model, "non-finite interval")),
        };
        Ok(Prediction {
            point,
            lower: lower.min(point).max(0.0),
            upper: upper.max(point),
        })
    }
}

/// Inputs for recursive projection of a feature-driven model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSeed {
    pub spec: FeatureSpec,
    pub state: ProjectionState,
}

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Fewest training points `fit` accepts.
    fn min_history(&self) -> usize;

    /// Production horizon in months.
    fn horizon(&self) -> usize;

    /// Regressor columns the adapter reads from the feature relation.
    fn required_regressors(&self) -> &[String] {
        &[]
    }

    /// Fits on exactly the supplied history and nothing else.
    fn fit(&self, history: History<'_>) -> Result<Box<dyn FittedModel>, ForecastError>;
}

pub trait FittedModel: Send {
    fn model_name(&self) -> &str;

    fn last_observed(&self) -> NaiveDate;

    /// One step past `last_observed`.
    fn predict_next(&self) -> Result<Estimate, ForecastError>;

    /// Direct path of `horizon` steps past `last_observed`.
    fn predict_path(&self, horizon: usize) -> Result<Vec<Estimate>, ForecastError>;

    /// Reveals the next observed month.
    fn update(&mut self, observed: &SeriesPoint) -> Result<(), ForecastError> {
        let _ = observed;
        Err(ForecastError::unsupported(self.model_name(), "incremental update"))
    }

    /// Feature state for recursive projection, if the model is feature-driven.
    fn projection(&self) -> Option<ProjectionSeed> {
        None
    }

    fn predict_features(&self, features: &FeatureVector) -> Result<Estimate, ForecastError> {
        let _ = features;
        Err(ForecastError::unsupported(self.model_name(), "feature prediction"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Family {
    Arima,
    Additive,
    Gbt,
    Rnn,
}

impl Family {
    /// Concurrent units allowed for this family.
    pub fn worker_limit(&self, runtime: &RuntimeConfig) -> usize {
        match self {
            Family::Rnn => runtime.recurrent_max_workers,
            _ => runtime.max_workers,
        }
    }

    pub fn model_name<'a>(&self, models: &'a ModelsConfig) -> &'a str {
        match self {
            Family::Arima => &models.arima.name,
            Family::Additive => &models.additive.name,
            Family::Gbt => &models.gbt.name,
            Family::Rnn => &models.rnn.name,
        }
    }
}

pub fn build_forecaster(
    family: Family,
    models: &ModelsConfig,
    intervals: &IntervalConfig,
) -> Result<Arc<dyn Forecaster>, ForecastError> {
    let forecaster: Arc<dyn Forecaster> = match family {
        Family::Arima => Arc::new(AutoregressiveForecaster::new(
            models.arima.clone(),
            intervals.confidence,
        )?),
        Family::Additive => Arc::new(AdditiveForecaster::new(
            models.additive.clone(),
            intervals.confidence,
        )?),
        Family::Gbt => Arc::new(BoostedTreeForecaster::new(models.gbt.clone())),
        Family::Rnn => Arc::new(RecurrentForecaster::new(models.rnn.clone())),
    };
    Ok(forecaster)
}

/// Standard normal quantile for a two-sided interval of the given coverage.
pub(crate) fn z_score(confidence: f64) -> Result<f64, ForecastError> {
    use statrs::distribution::{ContinuousCDF, Normal};
    if !(0.0 < confidence && confidence < 1.0) {
        return Err(ForecastError::fit(
            "interval",
            format!("confidence {confidence} outside (0, 1)"),
        ));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| ForecastError::fit("interval", e))?;
    Ok(normal.inverse_cdf(0.5 + confidence / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const BAND: Capabilities = Capabilities {
        supports_incremental_update: false,
        supports_direct_multi_horizon: false,
        interval: IntervalSource::FixedBand,
    };
    const NATIVE: Capabilities = Capabilities {
        supports_incremental_update: true,
        supports_direct_multi_horizon: true,
        interval: IntervalSource::Native,
    };

    #[test]
    fn test_band_applied_for_fixed_band_family() {
        let p = BoundPolicy::new(0.05)
            .resolve("rnn_v1", BAND, Estimate::with_interval(200.0, 1.0, 2.0))
            .unwrap();
        assert_eq!(p.point, 200.0);
        assert!((p.lower - 190.0).abs() < 1e-9);
        assert!((p.upper - 210.0).abs() < 1e-9);
    }

    #[test]
    fn test_native_interval_is_ordered_and_floored() {
        let p = BoundPolicy::new(0.05)
            .resolve("arima_v4", NATIVE, Estimate::with_interval(10.0, -5.0, 8.0))
            .unwrap();
        assert_eq!(p.lower, 0.0);
        assert_eq!(p.upper, 10.0);
    }

    #[test]
    fn test_negative_point_floored() {
        let p = BoundPolicy::new(0.1)
            .resolve("arima_v4", NATIVE, Estimate::with_interval(-3.0, -9.0, 2.0))
            .unwrap();
        assert_eq!((p.lower, p.point, p.upper), (0.0, 0.0, 2.0));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = BoundPolicy::new(0.1)
            .resolve("gbt_v1", BAND, Estimate::point(f64::NAN))
            .unwrap_err();
        assert!(matches!(err, ForecastError::FitFailure { .. }));
    }

    #[test]
    fn test_family_names_round_trip_through_strum() {
        assert_eq!(Family::from_str("gbt").unwrap(), Family::Gbt);
        assert_eq!(Family::Rnn.to_string(), "rnn");
    }

    #[test]
    fn test_recurrent_worker_cap() {
        let runtime = RuntimeConfig::default();
        assert_eq!(Family::Rnn.worker_limit(&runtime), runtime.recurrent_max_workers);
        assert_eq!(Family::Arima.worker_limit(&runtime), runtime.max_workers);
    }

    #[test]
    fn test_z_score_95() {
        assert!((z_score(0.95).unwrap() - 1.959964).abs() < 1e-4);
    }
}
