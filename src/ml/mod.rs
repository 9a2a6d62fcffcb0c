//! Numerical building blocks behind the forecasting families.
//!
//! - `ols`: ridge-stabilised least squares with prediction variance
//! - `gbt`: gradient boosted regression trees (squared and pinball loss)
//! - `rnn`: a small Elman recurrent network trained with BPTT

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod gbt;
pub mod ols;
pub mod rnn;

/// Named feature row handed from a projector to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<f64>,
    pub feature_names: Vec<String>,
}

impl FeatureVector {
    pub fn new(features: Vec<f64>, feature_names: Vec<String>) -> Result<Self> {
        if features.len() != feature_names.len() {
            anyhow::bail!(
                "Feature count mismatch: {} features, {} names",
                features.len(),
                feature_names.len()
            );
        }
        Ok(Self {
            features,
            feature_names,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.feature_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.features[i])
    }
}

/// Min-max scaling fitted on a training sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: f64,
    pub max: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Result<Self> {
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        if !min.is_finite() || !max.is_finite() {
            anyhow::bail!("Cannot fit scaler on empty or non-finite data");
        }
        if (max - min).abs() < 1e-10 {
            anyhow::bail!("Cannot fit scaler on a constant sample");
        }
        Ok(Self { min, max })
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.min) / (self.max - self.min)
    }

    pub fn inverse(&self, scaled: f64) -> f64 {
        scaled * (self.max - self.min) + self.min
    }
}
