use std::sync::Arc;
use tracing::debug;

use super::RecordTemplate;
use crate::config::Config;
use crate::domain::{add_months, PredictionRecord, Series};
use crate::error::ForecastError;
use crate::forecast::{
    BoundPolicy, Capabilities, FeatureProjector, FittedModel, Forecaster, Prediction,
    ProjectionMode,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ProductionSettings {
    pub band_pct: f64,
    pub projection: ProjectionMode,
    pub features_version: String,
}

impl ProductionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            band_pct: config.intervals.band_pct,
            projection: config.production.projection,
            features_version: config.features_version.clone(),
        }
    }
}

/// Refits on the full history and emits `horizon` forward months.
pub struct ProductionRunner {
    forecaster: Arc<dyn Forecaster>,
    settings: ProductionSettings,
}

impl ProductionRunner {
    pub fn new(forecaster: Arc<dyn Forecaster>, settings: ProductionSettings) -> Self {
        Self {
            forecaster,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        self.forecaster.name()
    }

    pub fn run(&self, series: &Series) -> Result<Vec<PredictionRecord>, ForecastError> {
        let history = series.history();
        let min_history = self.forecaster.min_history();
        if history.len() < min_history {
            return Err(ForecastError::InsufficientHistory {
                needed: min_history,
                found: history.len(),
            });
        }
        if history.is_degenerate() {
            return Err(ForecastError::DegenerateSeries);
        }

        let model = self.forecaster.fit(history)?;
        let horizon = self.forecaster.horizon();
        let predictions = self.forecast(model.as_ref(), horizon)?;

        let last = model.last_observed();
        let template = RecordTemplate::new(
            self.forecaster.name().to_string(),
            &series.key,
            &self.settings.features_version,
        );
        let rows: Vec<PredictionRecord> = (1..=horizon as u32)
            .zip(predictions)
            .map(|(h, p)| template.record(h as i32, add_months(last, h), p, None))
            .collect();

        debug!(unit = %series.key, model = self.forecaster.name(), horizon, "production forecast complete");
        Ok(rows)
    }

    /// Direct path when the family supports it, otherwise recursive
    /// projection through the model's feature state. Feature-less models
    /// without a direct path fall back to their degraded `predict_path`.
    fn forecast(
        &self,
        model: &dyn FittedModel,
        horizon: usize,
    ) -> Result<Vec<Prediction>, ForecastError> {
        let capabilities = self.forecaster.capabilities();
        if capabilities.supports_direct_multi_horizon {
            return self.resolve_path(model, capabilities, horizon);
        }
        let Some(seed) = model.projection() else {
            return self.resolve_path(model, capabilities, horizon);
        };

        let policy = BoundPolicy::new(self.settings.band_pct);
        let projector = FeatureProjector::new(seed.spec, self.settings.projection);
        let mut state = seed.state;
        let mut predictions = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            let estimate = model.predict_features(&projector.features(&state))?;
            let prediction = policy.resolve(model.model_name(), capabilities, estimate)?;
            projector.project(&mut state, prediction.point);
            predictions.push(prediction);
        }
        Ok(predictions)
    }

    fn resolve_path(
        &self,
        model: &dyn FittedModel,
        capabilities: Capabilities,
        horizon: usize,
    ) -> Result<Vec<Prediction>, ForecastError> {
        let policy = BoundPolicy::new(self.settings.band_pct);
        let path = model.predict_path(horizon)?;
        if path.len() != horizon {
            return Err(ForecastError::fit(
                model.model_name(),
                format!("path of {} steps for horizon {horizon}", path.len()),
            ));
        }
        path.into_iter()
            .map(|estimate| policy.resolve(model.model_name(), capabilities, estimate))
            .collect()
    }
}
