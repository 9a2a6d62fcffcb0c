use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ForecastError;

/// One independent unit of work: a target series for a city, optionally
/// narrowed to a property type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub city: String,
    pub target: String,
    pub property_type: Option<String>,
}

impl UnitKey {
    pub fn new(city: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            target: target.into(),
            property_type: None,
        }
    }

    pub fn with_property_type(mut self, property_type: impl Into<String>) -> Self {
        self.property_type = Some(property_type.into());
        self
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property_type {
            Some(pt) => write!(f, "{}/{}/{}", self.city, self.target, pt),
            None => write!(f, "{}/{}", self.city, self.target),
        }
    }
}

/// A monthly observation. `regressors` is aligned with the owning series'
/// `regressor_names`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
    #[serde(default)]
    pub regressors: Vec<f64>,
}

impl SeriesPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self {
            date,
            value,
            regressors: Vec::new(),
        }
    }

    pub fn with_regressors(mut self, regressors: Vec<f64>) -> Self {
        self.regressors = regressors;
        self
    }
}

/// Clean, gap-free monthly series for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub key: UnitKey,
    regressor_names: Vec<String>,
    points: Vec<SeriesPoint>,
}

impl Series {
    /// Builds a series, rejecting unordered dates, calendar gaps and
    /// regressor rows that do not match `regressor_names`.
    pub fn new(
        key: UnitKey,
        regressor_names: Vec<String>,
        points: Vec<SeriesPoint>,
    ) -> Result<Self, ForecastError> {
        for pair in points.windows(2) {
            if months_between(pair[0].date, pair[1].date) != 1 {
                return Err(ForecastError::NonContiguousSeries {
                    after: pair[0].date,
                    next: pair[1].date,
                });
            }
        }
        if let Some(bad) = points
            .iter()
            .find(|p| p.regressors.len() != regressor_names.len())
        {
            return Err(ForecastError::FeatureMismatch(format!(
                "{} carries {} regressor values, expected {}",
                bad.date,
                bad.regressors.len(),
                regressor_names.len()
            )));
        }
        Ok(Self {
            key,
            regressor_names,
            points,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn regressor_names(&self) -> &[String] {
        &self.regressor_names
    }

    pub fn history(&self) -> History<'_> {
        History {
            regressor_names: &self.regressor_names,
            points: &self.points,
        }
    }

    /// Number of points dated on or before `cutoff`.
    pub fn split_index(&self, cutoff: NaiveDate) -> usize {
        self.points.partition_point(|p| p.date <= cutoff)
    }
}

/// Borrowed, read-only view over a prefix of a series. Forecasters only ever
/// receive a `History`, so the slice bounds are the leakage boundary.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    pub regressor_names: &'a [String],
    pub points: &'a [SeriesPoint],
}

impl<'a> History<'a> {
    pub fn new(regressor_names: &'a [String], points: &'a [SeriesPoint]) -> Self {
        Self {
            regressor_names,
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The first `n` points.
    pub fn head(&self, n: usize) -> History<'a> {
        History {
            regressor_names: self.regressor_names,
            points: &self.points[..n.min(self.points.len())],
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    pub fn regressor_index(&self, name: &str) -> Option<usize> {
        self.regressor_names.iter().position(|n| n == name)
    }

    /// True when the values carry no usable signal: empty, non-finite or
    /// constant.
    pub fn is_degenerate(&self) -> bool {
        is_degenerate(self.points.iter().map(|p| p.value))
    }
}

pub fn is_degenerate(values: impl IntoIterator<Item = f64>) -> bool {
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return true;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() <= 1e-12 * mean.abs().max(1.0)
}

/// Whole calendar months from `from` to `to`, ignoring the day of month.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX)
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}
