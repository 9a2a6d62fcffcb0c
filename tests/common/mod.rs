#![allow(dead_code)]

use chrono::NaiveDate;
use parking_lot::Mutex;
use std::sync::Arc;

use housing_forecast_engine::config::{Config, SourceConfig};
use housing_forecast_engine::domain::{add_months, History, Series, SeriesPoint, UnitKey};
use housing_forecast_engine::forecast::{
    Capabilities, Estimate, Family, FittedModel, Forecaster, IntervalSource,
};
use housing_forecast_engine::pipeline::EngineSettings;
use housing_forecast_engine::repo::memory::MemoryFeatureStore;
use housing_forecast_engine::ForecastError;

pub const REGRESSORS: [&str; 3] = ["mortgage_rate_z", "unemployment_rate_z", "cpi_yoy_z"];

pub fn ymd(y: i32, m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, 1).unwrap()
}

/// Trend, yearly season and a deterministic wobble, with the three default
/// regressors attached.
pub fn housing_series(city: &str, start: NaiveDate, months: usize, level: f64) -> Series {
    let points = (0..months)
        .map(|i| {
            let t = i as f64;
            let season = (t / 12.0 * std::f64::consts::TAU).sin();
            let wobble = ((i * 7919) % 13) as f64 - 6.0;
            let value = level * (1.0 + 0.004 * t) + level * 0.02 * season + wobble;
            let regressors = vec![
                (t / 20.0).sin(),
                (t / 31.0).cos(),
                ((i * 31) % 7) as f64 / 7.0 - 0.5,
            ];
            SeriesPoint::new(add_months(start, i as u32), value).with_regressors(regressors)
        })
        .collect();
    Series::new(
        UnitKey::new(city, "price"),
        REGRESSORS.iter().map(|s| s.to_string()).collect(),
        points,
    )
    .unwrap()
}

pub fn flat_series(city: &str, start: NaiveDate, months: usize) -> Series {
    let points = (0..months)
        .map(|i| SeriesPoint::new(add_months(start, i as u32), 450_000.0).with_regressors(vec![0.0; 3]))
        .collect();
    Series::new(
        UnitKey::new(city, "price"),
        REGRESSORS.iter().map(|s| s.to_string()).collect(),
        points,
    )
    .unwrap()
}

pub fn feature_store(series: &[Series]) -> Arc<MemoryFeatureStore> {
    let store = Arc::new(MemoryFeatureStore::new());
    for s in series {
        store.insert_series(s, "hpi_benchmark");
    }
    store
}

/// Defaults with cutoff 2020-12 and light model settings.
pub fn test_config() -> Config {
    let mut config = Config {
        features_version: "features_test_v1".into(),
        ..Default::default()
    };
    config.backtest.cutoff = ymd(2020, 12);
    config.source = SourceConfig::default();
    config.runtime.max_workers = 4;
    config.runtime.batch_size = 50;
    config.models.arima.horizon = 24;
    config.models.additive.horizon = 24;
    config.models.gbt.horizon = 12;
    config.models.gbt.n_estimators = 20;
    config.models.rnn.horizon = 12;
    config.models.rnn.epochs = 5;
    config
}

pub fn settings(config: &Config, family: Family) -> EngineSettings {
    EngineSettings::from_config(config, family)
}

/// Persistence forecaster that logs, at every one-step prediction, the latest
/// date its state was built from.
pub struct RecordingForecaster {
    pub incremental: bool,
    pub seen_at_predict: Arc<Mutex<Vec<NaiveDate>>>,
}

impl RecordingForecaster {
    pub fn new(incremental: bool) -> Self {
        Self {
            incremental,
            seen_at_predict: Arc::default(),
        }
    }
}

impl Forecaster for RecordingForecaster {
    fn name(&self) -> &str {
        "recording_v1"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental_update: self.incremental,
            supports_direct_multi_horizon: true,
            interval: IntervalSource::FixedBand,
        }
    }

    fn min_history(&self) -> usize {
        12
    }

    fn horizon(&self) -> usize {
        6
    }

    fn fit(&self, history: History<'_>) -> Result<Box<dyn FittedModel>, ForecastError> {
        let max_seen = history
            .points
            .iter()
            .map(|p| p.date)
            .max()
            .ok_or(ForecastError::DegenerateSeries)?;
        let last = history.points.last().ok_or(ForecastError::DegenerateSeries)?;
        Ok(Box::new(Recording {
            max_seen,
            value: last.value,
            log: self.seen_at_predict.clone(),
        }))
    }
}

struct Recording {
    max_seen: NaiveDate,
    value: f64,
    log: Arc<Mutex<Vec<NaiveDate>>>,
}

impl FittedModel for Recording {
    fn model_name(&self) -> &str {
        "recording_v1"
    }

    fn last_observed(&self) -> NaiveDate {
        self.max_seen
    }

    fn predict_next(&self) -> Result<Estimate, ForecastError> {
        self.log.lock().push(self.max_seen);
        Ok(Estimate::point(self.value))
    }

    fn predict_path(&self, horizon: usize) -> Result<Vec<Estimate>, ForecastError> {
        Ok(vec![Estimate::point(self.value); horizon])
    }

    fn update(&mut self, observed: &SeriesPoint) -> Result<(), ForecastError> {
        self.max_seen = self.max_seen.max(observed.date);
        self.value = observed.value;
        Ok(())
    }
}
