//! Feature construction for feature-driven families.
//!
//! `FeatureProjector` owns both halves of the lag/rolling/YoY logic: building
//! training rows from observed history and advancing a projection state with
//! predicted values during recursive forecasting.

use serde::{Deserialize, Serialize};

use crate::domain::History;
use crate::error::ForecastError;
use crate::ml::FeatureVector;

/// Months between a value and its year-over-year reference.
const YEAR: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Target value `k` months back.
    Lag(usize),
    /// Mean of the last `w` target values.
    RollingMean(usize),
    /// Relative change of the latest value against twelve months earlier.
    YearOverYear,
    /// Exogenous column, taken from the latest observed month.
    Regressor(String),
}

impl FeatureKind {
    pub fn name(&self) -> String {
        match self {
            Self::Lag(k) => format!("lag_{k}"),
            Self::RollingMean(w) => format!("roll_{w}"),
            Self::YearOverYear => "yoy".to_string(),
            Self::Regressor(name) => name.clone(),
        }
    }

    /// Target values that must precede a row before it can be built.
    fn warmup(&self) -> usize {
        match self {
            Self::Lag(k) => *k,
            Self::RollingMean(w) => *w,
            Self::YearOverYear => YEAR + 1,
            Self::Regressor(_) => 1,
        }
    }
}

/// How rolling means are refreshed once predictions enter the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Every rolling mean is replaced by the latest prediction.
    #[default]
    LatestPrediction,
    /// Rolling means are recomputed over the window of observed and
    /// predicted values.
    TrueWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    kinds: Vec<FeatureKind>,
}

impl FeatureSpec {
    pub fn new(kinds: Vec<FeatureKind>) -> Self {
        Self { kinds }
    }

    /// Lags, rolling means, optional YoY then regressors, in that order.
    pub fn standard(
        lags: &[usize],
        windows: &[usize],
        year_over_year: bool,
        regressors: &[String],
    ) -> Self {
        let mut kinds: Vec<FeatureKind> = lags.iter().map(|k| FeatureKind::Lag(*k)).collect();
        kinds.extend(windows.iter().map(|w| FeatureKind::RollingMean(*w)));
        if year_over_year {
            kinds.push(FeatureKind::YearOverYear);
        }
        kinds.extend(regressors.iter().cloned().map(FeatureKind::Regressor));
        Self { kinds }
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn names(&self) -> Vec<String> {
        self.kinds.iter().map(FeatureKind::name).collect()
    }

    pub fn warmup(&self) -> usize {
        self.kinds.iter().map(FeatureKind::warmup).max().unwrap_or(0)
    }

    pub fn regressor_names(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().filter_map(|k| match k {
            FeatureKind::Regressor(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Rolling state for recursive projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionState {
    tail: Vec<f64>,
    rolling_override: Option<f64>,
    regressors: Vec<f64>,
    capacity: usize,
}

impl ProjectionState {
    /// Most recent values, oldest first.
    pub fn tail(&self) -> &[f64] {
        &self.tail
    }

    pub fn regressors(&self) -> &[f64] {
        &self.regressors
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureProjector {
    spec: FeatureSpec,
    mode: ProjectionMode,
}

impl FeatureProjector {
    pub fn new(spec: FeatureSpec, mode: ProjectionMode) -> Self {
        Self { spec, mode }
    }

    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    fn regressor_columns(&self, history: &History<'_>) -> Result<Vec<usize>, ForecastError> {
        self.spec
            .regressor_names()
            .map(|name| {
                history.regressor_index(name).ok_or_else(|| {
                    ForecastError::FeatureMismatch(format!("regressor column {name} is not loaded"))
                })
            })
            .collect()
    }

    /// Training rows `(features, target)`. The row for month t only reads
    /// target values before t and regressors of month t-1.
    pub fn rows_from_history(
        &self,
        history: History<'_>,
    ) -> Result<(Vec<Vec<f64>>, Vec<f64>), ForecastError> {
        let warmup = self.spec.warmup().max(1);
        if history.len() <= warmup {
            return Err(ForecastError::InsufficientHistory {
                needed: warmup + 1,
                found: history.len(),
            });
        }
        let columns = self.regressor_columns(&history)?;
        let values = history.values();

        let mut rows = Vec::with_capacity(values.len() - warmup);
        let mut targets = Vec::with_capacity(values.len() - warmup);
        for t in warmup..values.len() {
            let previous = &history.points[t - 1];
            let regressors: Vec<f64> = columns.iter().map(|c| previous.regressors[*c]).collect();
            rows.push(self.row(&values[..t], None, &regressors));
            targets.push(values[t]);
        }
        Ok((rows, targets))
    }

    /// State positioned just after the last observed month.
    pub fn seed(&self, history: History<'_>) -> Result<ProjectionState, ForecastError> {
        let capacity = self.spec.warmup().max(1);
        if history.len() < capacity {
            return Err(ForecastError::InsufficientHistory {
                needed: capacity,
                found: history.len(),
            });
        }
        let columns = self.regressor_columns(&history)?;
        let values = history.values();
        let regressors = match history.points.last() {
            Some(last) => columns.iter().map(|c| last.regressors[*c]).collect(),
            None => Vec::new(),
        };
        Ok(ProjectionState {
            tail: values[values.len() - capacity..].to_vec(),
            rolling_override: None,
            regressors,
            capacity,
        })
    }

    /// Feature row for the month following the state.
    pub fn features(&self, state: &ProjectionState) -> FeatureVector {
        FeatureVector {
            features: self.row(&state.tail, state.rolling_override, &state.regressors),
            feature_names: self.spec.names(),
        }
    }

    /// Feeds a predicted value back into the state. Lags and YoY shift
    /// exactly, regressors hold, rolling means follow the projection mode.
    pub fn project(&self, state: &mut ProjectionState, predicted: f64) {
        state.tail.push(predicted);
        if state.tail.len() > state.capacity {
            let excess = state.tail.len() - state.capacity;
            state.tail.drain(..excess);
        }
        state.rolling_override = match self.mode {
            ProjectionMode::LatestPrediction => Some(predicted),
            ProjectionMode::TrueWindow => None,
        };
    }

    fn row(&self, tail: &[f64], rolling_override: Option<f64>, regressors: &[f64]) -> Vec<f64> {
        let n = tail.len();
        let mut next_regressor = regressors.iter();
        self.spec
            .kinds
            .iter()
            .map(|kind| match kind {
                FeatureKind::Lag(k) => tail[n - k],
                FeatureKind::RollingMean(w) => rolling_override
                    .unwrap_or_else(|| tail[n - w..].iter().sum::<f64>() / *w as f64),
                FeatureKind::YearOverYear => {
                    let base = tail[n - 1 - YEAR];
                    if base.abs() < f64::EPSILON {
                        0.0
                    } else {
                        (tail[n - 1] - base) / base
                    }
                }
                FeatureKind::Regressor(_) => next_regressor.next().copied().unwrap_or(0.0),
            })
            .collect()
    }
}
