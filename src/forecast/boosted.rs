//! Gradient boosted trees over lag, rolling-mean, year-over-year and
//! regressor features. Bounds come from two quantile-loss twins trained on
//! the same rows.

use chrono::NaiveDate;

use super::features::{FeatureProjector, FeatureSpec, ProjectionMode, ProjectionState};
use super::{Capabilities, Estimate, FittedModel, Forecaster, IntervalSource, ProjectionSeed};
use crate::config::GbtConfig;
use crate::domain::History;
use crate::error::ForecastError;
use crate::ml::gbt::{BoostingParams, GradientBoostedTrees, Loss};
use crate::ml::FeatureVector;

pub struct BoostedTreeForecaster {
    cfg: GbtConfig,
    spec: FeatureSpec,
}

impl BoostedTreeForecaster {
    pub fn new(cfg: GbtConfig) -> Self {
        let spec = FeatureSpec::standard(
            &cfg.lags,
            &cfg.rolling_windows,
            cfg.year_over_year,
            &cfg.regressors,
        );
        Self { cfg, spec }
    }

    fn params(&self) -> BoostingParams {
        BoostingParams {
            n_estimators: self.cfg.n_estimators,
            learning_rate: self.cfg.learning_rate,
            max_depth: self.cfg.max_depth,
            min_samples_leaf: self.cfg.min_samples_leaf,
        }
    }
}

impl Forecaster for BoostedTreeForecaster {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental_update: false,
            supports_direct_multi_horizon: false,
            interval: IntervalSource::QuantileTwins,
        }
    }

    fn min_history(&self) -> usize {
        self.cfg.min_history.max(self.spec.warmup() + 12)
    }

    fn horizon(&self) -> usize {
        self.cfg.horizon
    }

    fn required_regressors(&self) -> &[String] {
        &self.cfg.regressors
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

        // Mode only affects `project`, which the pipeline drives with its own
        // projector.
        let projector = FeatureProjector::new(self.spec.clone(), ProjectionMode::default());
        let (rows, targets) = projector.rows_from_history(history)?;
        let state = projector.seed(history)?;

        let params = self.params();
        let train = |loss| {
            GradientBoostedTrees::fit(&rows, &targets, loss, &params)
                .map_err(|e| ForecastError::fit(&self.cfg.name, e))
        };
        let point = train(Loss::Squared)?;
        let lower = train(Loss::Quantile(self.cfg.lower_quantile))?;
        let upper = train(Loss::Quantile(self.cfg.upper_quantile))?;

        Ok(Box::new(FittedBoosted {
            name: self.cfg.name.clone(),
            projector,
            state,
            last_date,
            point,
            lower,
            upper,
        }))
    }
}

struct FittedBoosted {
    name: String,
    projector: FeatureProjector,
    state: ProjectionState,
    last_date: NaiveDate,
    point: GradientBoostedTrees,
    lower: GradientBoostedTrees,
    upper: GradientBoostedTrees,
}

impl FittedModel for FittedBoosted {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn last_observed(&self) -> NaiveDate {
        self.last_date
    }

    fn predict_next(&self) -> Result<Estimate, ForecastError> {
        self.predict_features(&self.projector.features(&self.state))
    }

    /// Degraded direct mode: the last observed feature row is reused for
    /// every step.
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
        if features.feature_names != self.projector.spec().names() {
            return Err(ForecastError::FeatureMismatch(format!(
                "{} expects features {:?}, got {:?}",
                self.name,
                self.projector.spec().names(),
                features.feature_names
            )));
        }
        let run = |model: &GradientBoostedTrees| {
            model
                .predict_one(&features.features)
                .map_err(|e| ForecastError::fit(&self.name, e))
        };
        let point = run(&self.point)?;
        let lower = run(&self.lower)?;
        let upper = run(&self.upper)?;
        Ok(Estimate::with_interval(point, lower.min(point), upper.max(point)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{add_months, SeriesPoint};

    fn points(n: usize) -> Vec<SeriesPoint> {
        let start = NaiveDate::from_ymd_opt(2012, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let noise = ((i * 17) % 9) as f64 - 4.0;
                SeriesPoint::new(add_months(start, i as u32), 300.0 + 2.0 * i as f64 + noise)
                    .with_regressors(vec![(i % 5) as f64 * 0.1])
            })
            .collect()
    }

    fn forecaster() -> BoostedTreeForecaster {
        BoostedTreeForecaster::new(GbtConfig {
            n_estimators: 40,
            regressors: vec!["cpi_yoy_z".into()],
            ..Default::default()
        })
    }

    #[test]
    fn test_fit_and_predict_with_twins() {
        let names = vec!["cpi_yoy_z".to_string()];
        let pts = points(72);
        let model = forecaster().fit(History::new(&names, &pts)).unwrap();
        let est = model.predict_next().unwrap();
        let (lo, hi) = est.interval.unwrap();
        assert!(lo <= est.point && est.point <= hi);
        assert!(est.point > 300.0);
    }

    #[test]
    fn test_projection_seed_matches_spec() {
        let names = vec!["cpi_yoy_z".to_string()];
        let pts = points(60);
        let model = forecaster().fit(History::new(&names, &pts)).unwrap();
        let seed = model.projection().unwrap();
        assert_eq!(
            seed.spec.names(),
            vec!["lag_1", "lag_3", "lag_6", "lag_12", "roll_3", "roll_6", "roll_12", "yoy", "cpi_yoy_z"]
        );
        assert_eq!(seed.state.tail().last(), Some(&pts[59].value));
    }

    #[test]
    fn test_degraded_path_is_static() {
        let names = vec!["cpi_yoy_z".to_string()];
        let pts = points(60);
        let model = forecaster().fit(History::new(&names, &pts)).unwrap();
        let path = model.predict_path(5).unwrap();
        assert_eq!(path.len(), 5);
        assert!(path.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_rejects_foreign_feature_row() {
        let names = vec!["cpi_yoy_z".to_string()];
        let pts = points(60);
        let model = forecaster().fit(History::new(&names, &pts)).unwrap();
        let fv = FeatureVector::new(vec![1.0], vec!["lag_1".into()]).unwrap();
        assert!(matches!(
            model.predict_features(&fv),
            Err(ForecastError::FeatureMismatch(_))
        ));
    }

    #[test]
    fn test_minimum_history_covers_warmup() {
        assert_eq!(forecaster().min_history(), 36);
        let f = BoostedTreeForecaster::new(GbtConfig {
            min_history: 12,
            ..Default::default()
        });
        assert_eq!(f.min_history(), 25);
    }
}
