//! Storage seams: the upstream feature relation, the shared predictions
//! relation and the comparison relation.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{ComparisonMetric, PredictionRecord, UnitKey};

pub mod memory;
pub mod writer;

#[cfg(feature = "db")]
pub mod pg;

pub use writer::{FailedBatch, PredictionWriter, UpsertReport};

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "db")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Raw row of the feature relation before cleaning.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub value: Option<f64>,
    /// Aligned with the requested regressor columns.
    pub regressors: Vec<Option<f64>>,
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Every distinct (city, property_type) in the feature relation.
    async fn discover_units(&self) -> Result<Vec<(String, Option<String>)>, StoreError>;

    /// Date-ordered rows for one unit: the target column plus the requested
    /// regressor columns.
    async fn fetch_rows(
        &self,
        unit: &UnitKey,
        column: &str,
        regressors: &[String],
    ) -> Result<Vec<FeatureRow>, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionSink: Send + Sync {
    /// Upserts one batch atomically, returning the number of rows written.
    async fn upsert_batch(&self, rows: &[PredictionRecord]) -> Result<u64, StoreError>;

    /// Rows of the given models that carry ground truth.
    async fn load_backtest_rows(
        &self,
        model_names: &[String],
    ) -> Result<Vec<PredictionRecord>, StoreError>;
}

#[async_trait]
pub trait ComparisonSink: Send + Sync {
    async fn upsert_metrics(&self, rows: &[ComparisonMetric]) -> Result<u64, StoreError>;
}

/// Column names are interpolated into SQL, so only lowercase snake case is
/// accepted.
pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hpi_benchmark", true)]
    #[case("cpi_yoy_z", true)]
    #[case("_private", true)]
    #[case("", false)]
    #[case("9lives", false)]
    #[case("rent; DROP TABLE model_predictions", false)]
    #[case("Rent", false)]
    fn test_identifier_validation(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_identifier(name).is_ok(), ok);
    }
}
