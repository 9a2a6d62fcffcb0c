use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for one (city, target) unit of work.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("insufficient history: need {needed} points, found {found}")]
    InsufficientHistory { needed: usize, found: usize },

    #[error("insufficient validation window: need {needed} points after the cutoff, found {found}")]
    InsufficientValidation { needed: usize, found: usize },

    #[error("degenerate series: zero variance or no finite values")]
    DegenerateSeries,

    #[error("series is not contiguous: {next} does not follow {after}")]
    NonContiguousSeries { after: NaiveDate, next: NaiveDate },

    #[error("{model} failed to fit: {reason}")]
    FitFailure { model: String, reason: String },

    #[error("{model} does not support {operation}")]
    Unsupported { model: String, operation: &'static str },

    #[error("feature mismatch: {0}")]
    FeatureMismatch(String),

    #[error("unit exceeded timeout of {0:?}")]
    Timeout(Duration),
}

impl ForecastError {
    pub fn fit(model: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FitFailure {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(model: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            model: model.into(),
            operation,
        }
    }

    /// Skippable conditions are reported and the run continues with exit
    /// status 3. Everything else points at a configuration or code defect.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientHistory { .. }
                | Self::InsufficientValidation { .. }
                | Self::DegenerateSeries
                | Self::NonContiguousSeries { .. }
                | Self::FitFailure { .. }
                | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skippable_classification() {
        assert!(ForecastError::DegenerateSeries.is_skippable());
        assert!(ForecastError::fit("arima_v4", "singular").is_skippable());
        assert!(ForecastError::Timeout(Duration::from_secs(1)).is_skippable());
        assert!(!ForecastError::FeatureMismatch("cpi_yoy_z".into()).is_skippable());
        assert!(!ForecastError::unsupported("gbt_v1", "update").is_skippable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = ForecastError::fit("additive_v1", "matrix not positive definite");
        assert_eq!(
            err.to_string(),
            "additive_v1 failed to fit: matrix not positive definite"
        );
    }
}
