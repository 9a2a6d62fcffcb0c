//! Walk-forward backtesting.
//!
//! The series is split at a fixed calendar cutoff. The model is fitted on the
//! training prefix and then walks the validation window one month at a time:
//! predict the next month, record it against the truth, and only then reveal
//! that month to the model. Families without incremental update are refitted
//! on the extended prefix instead.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::debug;

use super::RecordTemplate;
use crate::config::Config;
use crate::domain::{add_months, months_between, PredictionRecord, Series};
use crate::error::ForecastError;
use crate::forecast::{BoundPolicy, Forecaster};

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestSettings {
    pub cutoff: NaiveDate,
    pub min_validation_points: usize,
    pub band_pct: f64,
    pub features_version: String,
}

impl BacktestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cutoff: config.backtest.cutoff,
            min_validation_points: config.backtest.min_validation_points,
            band_pct: config.intervals.band_pct,
            features_version: config.features_version.clone(),
        }
    }
}

/// Backtest rows are stored under a suffixed name so they never share a
/// conflict key with production rows.
pub fn backtest_model_name(model_name: &str) -> String {
    format!("{model_name}_backtest")
}

pub struct Backtester {
    forecaster: Arc<dyn Forecaster>,
    settings: BacktestSettings,
}

impl Backtester {
    pub fn new(forecaster: Arc<dyn Forecaster>, settings: BacktestSettings) -> Self {
        Self {
            forecaster,
            settings,
        }
    }

    pub fn model_name(&self) -> String {
        backtest_model_name(self.forecaster.name())
    }

    /// One row per validation month, in date order, all sharing a run id.
    pub fn run(&self, series: &Series) -> Result<Vec<PredictionRecord>, ForecastError> {
        let name = self.forecaster.name();
        let history = series.history();
        let split = series.split_index(self.settings.cutoff);
        let validation = &series.points()[split..];

        let min_history = self.forecaster.min_history();
        if split < min_history {
            return Err(ForecastError::InsufficientHistory {
                needed: min_history,
                found: split,
            });
        }
        let min_validation = self.settings.min_validation_points.max(1);
        if validation.len() < min_validation {
            return Err(ForecastError::InsufficientValidation {
                needed: min_validation,
                found: validation.len(),
            });
        }
        let train = history.head(split);
        if train.is_degenerate() {
            return Err(ForecastError::DegenerateSeries);
        }

        let capabilities = self.forecaster.capabilities();
        let policy = BoundPolicy::new(self.settings.band_pct);
        let template = RecordTemplate::new(
            self.model_name(),
            &series.key,
            &self.settings.features_version,
        );

        let mut model = self.forecaster.fit(train)?;
        let mut rows = Vec::with_capacity(validation.len());
        for (step, point) in validation.iter().enumerate() {
            let expected = add_months(model.last_observed(), 1);
            if expected != point.date {
                return Err(ForecastError::FeatureMismatch(format!(
                    "{name} would forecast {expected} but the next validation month is {}",
                    point.date
                )));
            }

            let estimate = model.predict_next()?;
            let prediction = policy.resolve(name, capabilities, estimate)?;
            let horizon = months_between(self.settings.cutoff, point.date);
            rows.push(template.record(horizon, point.date, prediction, Some(point.value)));

            if step + 1 == validation.len() {
                break;
            }
            if capabilities.supports_incremental_update {
                model.update(point)?;
            } else {
                model = self.forecaster.fit(history.head(split + step + 1))?;
            }
        }

        debug!(
            unit = %series.key,
            model = name,
            train = split,
            validation = rows.len(),
            "backtest complete"
        );
        Ok(rows)
    }
}
