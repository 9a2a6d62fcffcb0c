//! Unit-level pipelines: read, backtest, forecast, evaluate, and the
//! orchestrator that runs them across units.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{PredictionRecord, UnitKey};
use crate::forecast::Prediction;

pub mod backtest;
pub mod evaluation;
pub mod orchestrator;
pub mod production;
pub mod reader;

pub use backtest::{backtest_model_name, BacktestSettings, Backtester};
pub use evaluation::{EvaluationHarness, EvaluationReport};
pub use orchestrator::{
    EngineSettings, ExitStatus, Orchestrator, RunSummary, Stage, Stages, UnitOutcome, UnitReport,
};
pub use production::{ProductionRunner, ProductionSettings};
pub use reader::{FeatureStoreReader, ReadError};

/// Shared fields of every row emitted by one run.
struct RecordTemplate<'a> {
    run_id: Uuid,
    model_name: String,
    unit: &'a UnitKey,
    features_version: &'a str,
    created_at: DateTime<Utc>,
}

impl<'a> RecordTemplate<'a> {
    fn new(model_name: String, unit: &'a UnitKey, features_version: &'a str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            model_name,
            unit,
            features_version,
            created_at: Utc::now(),
        }
    }

    fn record(
        &self,
        horizon_months: i32,
        predict_date: NaiveDate,
        prediction: Prediction,
        y_true: Option<f64>,
    ) -> PredictionRecord {
        PredictionRecord {
            run_id: self.run_id,
            model_name: self.model_name.clone(),
            target: self.unit.target.clone(),
            city: self.unit.city.clone(),
            property_type: self.unit.property_type.clone(),
            horizon_months,
            predict_date,
            yhat: prediction.point,
            yhat_lower: prediction.lower,
            yhat_upper: prediction.upper,
            y_true,
            features_version: self.features_version.to_string(),
            created_at: self.created_at,
            is_micro: false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Persistence forecaster that records every date it was shown.

    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use crate::domain::{add_months, History, Series, SeriesPoint, UnitKey};
    use crate::error::ForecastError;
    use crate::forecast::{Capabilities, Estimate, FittedModel, Forecaster, IntervalSource};

    pub fn ymd(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    pub fn series(city: &str, start: NaiveDate, values: &[f64]) -> Series {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| SeriesPoint::new(add_months(start, i as u32), *v))
            .collect();
        Series::new(UnitKey::new(city, "price"), vec![], points).unwrap()
    }

    pub fn trending(city: &str, start: NaiveDate, n: usize) -> Series {
        let values: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * 2.0).collect();
        series(city, start, &values)
    }

    pub struct StubForecaster {
        pub incremental: bool,
        pub min_history: usize,
        pub horizon: usize,
        /// Latest date seen by each fit or update, in call order.
        pub seen: Arc<Mutex<Vec<NaiveDate>>>,
    }

    impl StubForecaster {
        pub fn new(incremental: bool) -> Self {
            Self {
                incremental,
                min_history: 6,
                horizon: 4,
                seen: Arc::default(),
            }
        }
    }

    impl Forecaster for StubForecaster {
        fn name(&self) -> &str {
            "stub_v1"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_incremental_update: self.incremental,
                supports_direct_multi_horizon: true,
                interval: IntervalSource::FixedBand,
            }
        }

        fn min_history(&self) -> usize {
            self.min_history
        }

        fn horizon(&self) -> usize {
            self.horizon
        }

        fn fit(&self, history: History<'_>) -> Result<Box<dyn FittedModel>, ForecastError> {
            let last = history.points.last().ok_or(ForecastError::DegenerateSeries)?;
            self.seen.lock().push(last.date);
            Ok(Box::new(FittedStub {
                last: last.date,
                value: last.value,
                seen: self.seen.clone(),
            }))
        }
    }

    struct FittedStub {
        last: NaiveDate,
        value: f64,
        seen: Arc<Mutex<Vec<NaiveDate>>>,
    }

    impl FittedModel for FittedStub {
        fn model_name(&self) -> &str {
            "stub_v1"
        }

        fn last_observed(&self) -> NaiveDate {
            self.last
        }

        fn predict_next(&self) -> Result<Estimate, ForecastError> {
            Ok(Estimate::point(self.value))
        }

        fn predict_path(&self, horizon: usize) -> Result<Vec<Estimate>, ForecastError> {
            Ok(vec![Estimate::point(self.value); horizon])
        }

        fn update(&mut self, observed: &SeriesPoint) -> Result<(), ForecastError> {
            self.seen.lock().push(observed.date);
            self.last = observed.date;
            self.value = observed.value;
            Ok(())
        }
    }
}
