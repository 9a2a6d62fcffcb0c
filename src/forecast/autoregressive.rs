//! ARIMA(p,1,0) with drift, estimated by least squares on the differenced
//! series. Supports true incremental update: each revealed month is appended
//! and the coefficients re-estimated.

use chrono::NaiveDate;

use super::{z_score, Capabilities, Estimate, FittedModel, Forecaster, IntervalSource};
use crate::config::ArimaConfig;
use crate::domain::{months_between, History, SeriesPoint};
use crate::error::ForecastError;
use crate::ml::ols;

pub struct AutoregressiveForecaster {
    cfg: ArimaConfig,
    z: f64,
}

impl AutoregressiveForecaster {
    pub fn new(cfg: ArimaConfig, confidence: f64) -> Result<Self, ForecastError> {
        Ok(Self {
            cfg,
            z: z_score(confidence)?,
        })
    }
}

impl Forecaster for AutoregressiveForecaster {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental_update: true,
            supports_direct_multi_horizon: true,
            interval: IntervalSource::Native,
        }
    }

    fn min_history(&self) -> usize {
        self.cfg.min_history.max(self.cfg.order + 3)
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

        let mut model = FittedArima {
            name: self.cfg.name.clone(),
            order: self.cfg.order,
            ridge: self.cfg.ridge,
            z: self.z,
            values: history.values(),
            last_date,
            intercept: 0.0,
            phi: Vec::new(),
            sigma: 0.0,
        };
        model.estimate()?;
        Ok(Box::new(model))
    }
}

#[derive(Debug, Clone)]
struct FittedArima {
    name: String,
    order: usize,
    ridge: f64,
    z: f64,
    values: Vec<f64>,
    last_date: NaiveDate,
    intercept: f64,
    phi: Vec<f64>,
    sigma: f64,
}

impl FittedArima {
    fn differences(&self) -> Vec<f64> {
        self.values.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn estimate(&mut self) -> Result<(), ForecastError> {
        let diffs = self.differences();
        let p = self.order;
        if diffs.len() <= p + 1 {
            return Err(ForecastError::InsufficientHistory {
                needed: p + 3,
                found: self.values.len(),
            });
        }

        let mut rows = Vec::with_capacity(diffs.len() - p);
        let mut targets = Vec::with_capacity(diffs.len() - p);
        for t in p..diffs.len() {
            let mut row = Vec::with_capacity(p + 1);
            row.push(1.0);
            row.extend((1..=p).map(|i| diffs[t - i]));
            rows.push(row);
            targets.push(diffs[t]);
        }

        let fit = ols::fit(&rows, &targets, self.ridge)
            .map_err(|e| ForecastError::fit(&self.name, e))?;
        let coefficients = fit.coefficients();
        self.intercept = coefficients[0];
        self.phi = coefficients[1..].to_vec();
        self.sigma = fit.sigma();
        Ok(())
    }

    /// Cumulated ψ-weights of the level process.
    fn level_psi(&self, horizon: usize) -> Vec<f64> {
        let mut psi = vec![1.0];
        for j in 1..horizon {
            let next = (1..=self.phi.len().min(j))
                .map(|i| self.phi[i - 1] * psi[j - i])
                .sum();
            psi.push(next);
        }
        psi.iter()
            .scan(0.0, |acc, w| {
                *acc += w;
                Some(*acc)
            })
            .collect()
    }
}

impl FittedModel for FittedArima {
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
        let mut recent = self.differences();
        let mut level = self.values.last().copied().unwrap_or(0.0);
        let psi = self.level_psi(horizon);
        let mut variance = 0.0;
        let mut path = Vec::with_capacity(horizon);

        for weight in psi.iter().take(horizon) {
            let n = recent.len();
            let step = self.intercept
                + self
                    .phi
                    .iter()
                    .enumerate()
                    .map(|(i, phi)| phi * recent[n - 1 - i])
                    .sum::<f64>();
            level += step;
            recent.push(step);
            variance += weight * weight;
            let half_width = self.z * self.sigma * variance.sqrt();
            if !level.is_finite() || !half_width.is_finite() {
                return Err(ForecastError::fit(&self.name, "forecast diverged"));
            }
            path.push(Estimate::with_interval(
                level,
                level - half_width,
                level + half_width,
            ));
        }
        Ok(path)
    }

    fn update(&mut self, observed: &SeriesPoint) -> Result<(), ForecastError> {
        if months_between(self.last_date, observed.date) != 1 {
            return Err(ForecastError::NonContiguousSeries {
                after: self.last_date,
                next: observed.date,
            });
        }
        self.values.push(observed.value);
        self.last_date = observed.date;
        self.estimate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::add_months;

    fn trend_points(n: usize) -> Vec<SeriesPoint> {
        let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let wiggle = ((i * 7919) % 13) as f64 - 6.0;
                SeriesPoint::new(add_months(start, i as u32), 1000.0 + 5.0 * i as f64 + wiggle)
            })
            .collect()
    }

    fn forecaster() -> AutoregressiveForecaster {
        AutoregressiveForecaster::new(ArimaConfig::default(), 0.95).unwrap()
    }

    #[test]
    fn test_path_follows_trend_and_widens() {
        let points = trend_points(60);
        let model = forecaster().fit(History::new(&[], &points)).unwrap();
        let path = model.predict_path(24).unwrap();
        assert_eq!(path.len(), 24);
        let last = points.last().unwrap().value;
        assert!(path[23].point > last);
        let width = |e: &Estimate| e.interval.map(|(lo, hi)| hi - lo).unwrap();
        assert!(width(&path[23]) > width(&path[0]));
        for e in &path {
            let (lo, hi) = e.interval.unwrap();
            assert!(lo <= e.point && e.point <= hi);
        }
    }

    #[test]
    fn test_update_advances_state() {
        let points = trend_points(50);
        let mut model = forecaster().fit(History::new(&[], &points[..40])).unwrap();
        for p in &points[40..45] {
            model.update(p).unwrap();
        }
        assert_eq!(model.last_observed(), points[44].date);
        let fresh = forecaster().fit(History::new(&[], &points[..45])).unwrap();
        let a = model.predict_next().unwrap().point;
        let b = fresh.predict_next().unwrap().point;
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_update_rejects_gap() {
        let points = trend_points(45);
        let mut model = forecaster().fit(History::new(&[], &points[..40])).unwrap();
        assert!(matches!(
            model.update(&points[42]),
            Err(ForecastError::NonContiguousSeries { .. })
        ));
    }

    #[test]
    fn test_short_and_constant_series_rejected() {
        let points = trend_points(20);
        assert!(matches!(
            forecaster().fit(History::new(&[], &points)).err(),
            Some(ForecastError::InsufficientHistory { needed: 36, found: 20 })
        ));
        let flat: Vec<SeriesPoint> = trend_points(40)
            .into_iter()
            .map(|p| SeriesPoint::new(p.date, 7.0))
            .collect();
        assert!(matches!(
            forecaster().fit(History::new(&[], &flat)).err(),
            Some(ForecastError::DegenerateSeries)
        ));
    }

    #[test]
    fn test_level_psi_weights() {
        let model = FittedArima {
            name: "arima".into(),
            order: 1,
            ridge: 0.0,
            z: 1.96,
            values: vec![],
            last_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            intercept: 0.0,
            phi: vec![0.0],
            sigma: 1.0,
        };
        assert_eq!(model.level_psi(4), vec![1.0, 1.0, 1.0, 1.0]);

        let damped = FittedArima {
            phi: vec![0.5],
            ..model
        };
        assert_eq!(damped.level_psi(4), vec![1.0, 1.5, 1.75, 1.875]);
    }
}
