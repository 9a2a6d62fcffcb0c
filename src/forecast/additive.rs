//! Additive regression: linear trend, Fourier seasonality and exogenous
//! regressors, fitted by least squares. Forecasts extend the design into the
//! future with regressors held at their last known value.

use chrono::{Datelike, NaiveDate};
use std::f64::consts::PI;

use super::{z_score, Capabilities, Estimate, FittedModel, Forecaster, IntervalSource};
use crate::config::AdditiveConfig;
use crate::domain::{add_months, months_between, History};
use crate::error::ForecastError;
use crate::ml::ols::{self, LinearFit};

pub struct AdditiveForecaster {
    cfg: AdditiveConfig,
    z: f64,
}

impl AdditiveForecaster {
    pub fn new(cfg: AdditiveConfig, confidence: f64) -> Result<Self, ForecastError> {
        Ok(Self {
            cfg,
            z: z_score(confidence)?,
        })
    }
}

impl Forecaster for AdditiveForecaster {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental_update: false,
            supports_direct_multi_horizon: true,
            interval: IntervalSource::Native,
        }
    }

    fn min_history(&self) -> usize {
        self.cfg.min_history
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
        let (origin, last_date) = match (history.first_date(), history.last_date()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ForecastError::InsufficientHistory { needed: 1, found: 0 }),
        };
        let columns: Vec<usize> = self
            .cfg
            .regressors
            .iter()
            .map(|name| {
                history.regressor_index(name).ok_or_else(|| {
                    ForecastError::FeatureMismatch(format!("regressor column {name} is not loaded"))
                })
            })
            .collect::<Result<_, _>>()?;

        let design = Design {
            origin,
            fourier_order: self.cfg.fourier_order,
            period: self.cfg.period,
        };
        let rows: Vec<Vec<f64>> = history
            .points
            .iter()
            .map(|p| {
                let regressors: Vec<f64> = columns.iter().map(|c| p.regressors[*c]).collect();
                design.row(p.date, &regressors)
            })
            .collect();
        let fit = ols::fit(&rows, &history.values(), self.cfg.ridge)
            .map_err(|e| ForecastError::fit(&self.cfg.name, e))?;

        let last_regressors = history
            .points
            .last()
            .map(|p| columns.iter().map(|c| p.regressors[*c]).collect())
            .unwrap_or_default();

        Ok(Box::new(FittedAdditive {
            name: self.cfg.name.clone(),
            design,
            fit,
            last_date,
            last_regressors,
            z: self.z,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct Design {
    origin: NaiveDate,
    fourier_order: usize,
    period: usize,
}

impl Design {
    /// Position within the seasonal cycle, counted in elapsed months so any
    /// period stays continuous across year boundaries. Calendar aligned:
    /// January is 0 when the period divides twelve.
    fn season_index(&self, date: NaiveDate) -> usize {
        let elapsed = months_between(self.origin, date) + self.origin.month0() as i32;
        elapsed.rem_euclid(self.period as i32) as usize
    }

    /// `[1, years since origin, sin/cos pairs..., regressors...]`
    fn row(&self, date: NaiveDate, regressors: &[f64]) -> Vec<f64> {
        let mut row = Vec::with_capacity(2 + 2 * self.fourier_order + regressors.len());
        row.push(1.0);
        row.push(months_between(self.origin, date) as f64 / 12.0);
        let phase = 2.0 * PI * self.season_index(date) as f64 / self.period as f64;
        for k in 1..=self.fourier_order {
            row.push((k as f64 * phase).sin());
            row.push((k as f64 * phase).cos());
        }
        row.extend_from_slice(regressors);
        row
    }
}

struct FittedAdditive {
    name: String,
    design: Design,
    fit: LinearFit,
    last_date: NaiveDate,
    last_regressors: Vec<f64>,
    z: f64,
}

impl FittedModel for FittedAdditive {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn last_observed(&self) -> NaiveDate {
        self.last_date
    }

    fn predict_next(&self) -> Result<Estimate, ForecastError> {
        self.predict_path(1)?
            .into_iter()
            .next()
            .ok_or_else(|| ForecastError::fit(&self.name, "empty forecast path"))
    }

    fn predict_path(&self, horizon: usize) -> Result<Vec<Estimate>, ForecastError> {
        (1..=horizon)
            .map(|step| {
                let date = add_months(self.last_date, step as u32);
                let row = self.design.row(date, &self.last_regressors);
                let point = self.fit.predict(&row);
                let half_width = self.z * self.fit.prediction_std(&row);
                if !point.is_finite() || !half_width.is_finite() {
                    return Err(ForecastError::fit(&self.name, "non-finite forecast"));
                }
                Ok(Estimate::with_interval(
                    point,
                    point - half_width,
                    point + half_width,
                ))
            })
            .collect()
    }
}
