//! Recurrent network over a fixed lookback window of min-max scaled values.
//! No native interval; the pipeline applies the configured band.

use chrono::NaiveDate;

use super::features::{FeatureKind, FeatureProjector, FeatureSpec, ProjectionMode, ProjectionState};
use super::{Capabilities, Estimate, FittedModel, Forecaster, IntervalSource, ProjectionSeed};
use crate::config::RnnConfig;
use crate::domain::History;
use crate::error::ForecastError;
use crate::ml::rnn::{ElmanNetwork, RnnParams};
use crate::ml::{FeatureVector, MinMaxScaler};

pub struct RecurrentForecaster {
    cfg: RnnConfig,
    spec: FeatureSpec,
}

impl RecurrentForecaster {
    pub fn new(cfg: RnnConfig) -> Self {
        // oldest first, so the feature row reads as a time-ordered sequence
        let spec = FeatureSpec::new((1..=cfg.lookback).rev().map(FeatureKind::Lag).collect());
        Self { cfg, spec }
    }
}

impl Forecaster for RecurrentForecaster {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental_update: false,
            supports_direct_multi_horizon: false,
            interval: IntervalSource::FixedBand,
        }
    }

    /// One full seasonal cycle of training windows plus the lookback.
    fn min_history(&self) -> usize {
        self.cfg.min_history.max(self.cfg.lookback + 24)
    }

    fn horizon(&self) -> usize {
        self.cfg.horizon
    }

    fn fit(&self, history: History<'_>) -> Result<Box<dyn FittedModel>, ForecastError> {
        if history.len() < self.min_history() {
            return Err(ForecastError::InsufficientHistory {
                needed: self.min_history(),
                found: history.len(),
            });
        }
        if history.is_degenerate() {
            return Err(ForecastError::DegenerateSeries);
        }
        let last_date = history
            .last_date()
            .ok_or(ForecastError::InsufficientHistory { needed: 1, found: 0 })?;

        let scaler =
            MinMaxScaler::fit(&history.values()).map_err(|e| ForecastError::fit(&self.cfg.name, e))?;
        let projector = FeatureProjector::new(self.spec.clone(), ProjectionMode::default());
        let (rows, targets) = projector.rows_from_history(history)?;
        let samples: Vec<(Vec<f64>, f64)> = rows
            .into_iter()
            .zip(targets)
            .map(|(row, y)| {
                (
                    row.into_iter().map(|v| scaler.transform(v)).collect(),
                    scaler.transform(y),
                )
            })
            .collect();

        let params = RnnParams {
            hidden: self.cfg.hidden,
            epochs: self.cfg.epochs,
            learning_rate: self.cfg.learning_rate,
            gradient_clip: self.cfg.gradient_clip,
            seed: self.cfg.seed,
        };
        let network =
            ElmanNetwork::train(&samples, &params).map_err(|e| ForecastError::fit(&self.cfg.name, e))?;
        let state = projector.seed(history)?;

        Ok(Box::new(FittedRecurrent {
            name: self.cfg.name.clone(),
            projector,
            state,
            last_date,
            scaler,
            network,
        }))
    }
}

struct FittedRecurrent {
    name: String,
    projector: FeatureProjector,
    state: ProjectionState,
    last_date: NaiveDate,
    scaler: MinMaxScaler,
    network: ElmanNetwork,
}

impl FittedModel for FittedRecurrent {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn last_observed(&self) -> NaiveDate {
        self.last_date
    }

    fn predict_next(&self) -> Result<Estimate, ForecastError> {
        self.predict_features(&self.projector.features(&self.state))
    }

    fn predict_path(&self, horizon: usize) -> Result<Vec<Estimate>, ForecastError> {
        let estimate = self.predict_next()?;
        Ok(vec![estimate; horizon])
    }

    fn projection(&self) -> Option<ProjectionSeed> {
        Some(ProjectionSeed {
            spec: self.projector.spec().clone(),
            state: self.state.clone(),
        })
    }

    fn predict_features(&self, features: &FeatureVector) -> Result<Estimate, ForecastError> {
        if features.len() != self.projector.spec().kinds().len() {
            return Err(ForecastError::FeatureMismatch(format!(
                "{} expects a window of {}, got {}",
                self.name,
                self.projector.spec().kinds().len(),
                features.len()
            )));
        }
        let window: Vec<f64> = features
            .features
            .iter()
            .map(|v| self.scaler.transform(*v))
            .collect();
        let value = self.scaler.inverse(self.network.predict(&window));
        if !value.is_finite() {
            return Err(ForecastError::fit(&self.name, "non-finite network output"));
        }
        Ok(Estimate::point(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{add_months, SeriesPoint};
    use std::f64::consts::PI;

    fn seasonal(n: usize) -> Vec<SeriesPoint> {
        let start = NaiveDate::from_ymd_opt(2013, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let v = 1500.0 + 3.0 * i as f64 + 40.0 * (2.0 * PI * i as f64 / 12.0).sin();
                SeriesPoint::new(add_months(start, i as u32), v)
            })
            .collect()
    }

    fn forecaster() -> RecurrentForecaster {
        RecurrentForecaster::new(RnnConfig {
            epochs: 30,
            hidden: 8,
            ..Default::default()
        })
    }

    #[test]
    fn test_window_spec_is_time_ordered() {
        let f = forecaster();
        let names = f.spec.names();
        assert_eq!(names.first().map(String::as_str), Some("lag_12"));
        assert_eq!(names.last().map(String::as_str), Some("lag_1"));
        assert_eq!(f.min_history(), 36);
    }

    #[test]
    fn test_fit_predicts_within_plausible_range() {
        let pts = seasonal(72);
        let model = forecaster().fit(History::new(&[], &pts)).unwrap();
        let est = model.predict_next().unwrap();
        assert!(est.interval.is_none());
        assert!(est.point > 1300.0 && est.point < 2000.0, "{}", est.point);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let pts = seasonal(60);
        let a = forecaster().fit(History::new(&[], &pts)).unwrap();
        let b = forecaster().fit(History::new(&[], &pts)).unwrap();
        assert_eq!(a.predict_next().unwrap(), b.predict_next().unwrap());
    }

    #[test]
    fn test_capabilities_request_band() {
        let caps = forecaster().capabilities();
        assert!(!caps.supports_native_interval());
        assert_eq!(caps.interval, IntervalSource::FixedBand);
    }
}
