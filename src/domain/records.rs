use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Row of the shared predictions relation. Backtest rows carry `y_true`,
/// production rows leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "db", derive(sqlx::FromRow))]
pub struct PredictionRecord {
    pub run_id: Uuid,
    pub model_name: String,
    pub target: String,
    pub city: String,
    pub property_type: Option<String>,
    pub horizon_months: i32,
    pub predict_date: NaiveDate,
    pub yhat: f64,
    pub yhat_lower: f64,
    pub yhat_upper: f64,
    pub y_true: Option<f64>,
    pub features_version: String,
    pub created_at: DateTime<Utc>,
    pub is_micro: bool,
}

impl PredictionRecord {
    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            model_name: self.model_name.clone(),
            target: self.target.clone(),
            city: self.city.clone(),
            property_type: self.property_type.clone(),
            horizon_months: self.horizon_months,
            predict_date: self.predict_date,
        }
    }
}

/// Conflict key of the predictions relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionKey {
    pub model_name: String,
    pub target: String,
    pub city: String,
    pub property_type: Option<String>,
    pub horizon_months: i32,
    pub predict_date: NaiveDate,
}

impl fmt::Display for PredictionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.model_name, self.city, self.target)?;
        if let Some(pt) = &self.property_type {
            write!(f, "/{pt}")?;
        }
        write!(f, " h{} {}", self.horizon_months, self.predict_date)
    }
}

/// Accuracy of one model on one (city, target, horizon) backtest group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "db", derive(sqlx::FromRow))]
pub struct ComparisonMetric {
    pub city: String,
    pub target: String,
    pub property_type: Option<String>,
    pub horizon_months: i32,
    pub model_name: String,
    pub mae: f64,
    pub mape: Option<f64>,
    pub rmse: f64,
    pub mse: f64,
    pub r2: Option<f64>,
    pub sample_count: i64,
    pub rank: Option<i32>,
    pub best_model: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl ComparisonMetric {
    pub fn key(&self) -> ComparisonKey {
        ComparisonKey {
            city: self.city.clone(),
            target: self.target.clone(),
            property_type: self.property_type.clone(),
            horizon_months: self.horizon_months,
            model_name: self.model_name.clone(),
        }
    }
}

/// Conflict key of the comparison relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComparisonKey {
    pub city: String,
    pub target: String,
    pub property_type: Option<String>,
    pub horizon_months: i32,
    pub model_name: String,
}
