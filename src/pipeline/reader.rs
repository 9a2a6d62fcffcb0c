use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::domain::{month_start, Series, SeriesPoint, UnitKey};
use crate::error::ForecastError;
use crate::repo::{FeatureRow, FeatureStore, StoreError};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Series(#[from] ForecastError),
}

/// Loads clean monthly series from the feature relation.
#[derive(Clone)]
pub struct FeatureStoreReader {
    store: Arc<dyn FeatureStore>,
}

impl FeatureStoreReader {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self { store }
    }

    /// Every discovered (city, property_type) crossed with `targets`.
    pub async fn discover(&self, targets: &[String]) -> Result<Vec<UnitKey>, StoreError> {
        let units = self.store.discover_units().await?;
        Ok(units
            .into_iter()
            .flat_map(|(city, property_type)| {
                targets.iter().map(move |target| UnitKey {
                    city: city.clone(),
                    target: target.clone(),
                    property_type: property_type.clone(),
                })
            })
            .collect())
    }

    pub async fn read(
        &self,
        unit: &UnitKey,
        column: &str,
        regressors: &[String],
        min_points: usize,
    ) -> Result<Series, ReadError> {
        let rows = self.store.fetch_rows(unit, column, regressors).await?;
        let series = clean(unit.clone(), regressors, rows)?;
        if series.len() < min_points {
            return Err(ForecastError::InsufficientHistory {
                needed: min_points,
                found: series.len(),
            }
            .into());
        }
        debug!(unit = %unit, points = series.len(), "series loaded");
        Ok(series)
    }
}

/// Applies the cleaning rules to date-ordered raw rows:
/// regressors are forward-filled (leading gaps become 0.0), leading and
/// trailing rows without a target are dropped, and an interior missing target
/// or calendar gap fails the unit.
pub fn clean(
    unit: UnitKey,
    regressor_names: &[String],
    rows: Vec<FeatureRow>,
) -> Result<Series, ForecastError> {
    let mut carried: Vec<Option<f64>> = vec![None; regressor_names.len()];
    let filled: Vec<(FeatureRow, Vec<f64>)> = rows
        .into_iter()
        .map(|row| {
            for (slot, cell) in carried.iter_mut().zip(&row.regressors) {
                if cell.is_some() {
                    *slot = *cell;
                }
            }
            let regressors = carried.iter().map(|c| c.unwrap_or(0.0)).collect();
            (row, regressors)
        })
        .collect();

    let first = filled.iter().position(|(r, _)| r.value.is_some());
    let last = filled.iter().rposition(|(r, _)| r.value.is_some());
    let (Some(first), Some(last)) = (first, last) else {
        return Series::new(unit, regressor_names.to_vec(), Vec::new());
    };

    let mut points = Vec::with_capacity(last - first + 1);
    for (row, regressors) in filled.into_iter().skip(first).take(last - first + 1) {
        let date = month_start(row.date);
        match row.value {
            Some(value) => points.push(SeriesPoint {
                date,
                value,
                regressors,
            }),
            None => {
                let after = points.last().map(|p: &SeriesPoint| p.date).unwrap_or(date);
                return Err(ForecastError::NonContiguousSeries { after, next: date });
            }
        }
    }
    Series::new(unit, regressor_names.to_vec(), points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::memory::MemoryFeatureStore;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn row(date: NaiveDate, value: Option<f64>, reg: Option<f64>) -> FeatureRow {
        FeatureRow {
            date,
            value,
            regressors: vec![reg],
        }
    }

    #[test]
    fn test_clean_trims_and_fills() {
        let rows = vec![
            row(ymd(2020, 1), None, None),
            row(ymd(2020, 2), Some(1.0), None),
            row(ymd(2020, 3), Some(2.0), Some(0.5)),
            row(ymd(2020, 4), Some(3.0), None),
            row(ymd(2020, 5), None, Some(0.7)),
        ];
        let series = clean(UnitKey::new("Toronto", "price"), &["cpi_yoy_z".into()], rows).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.points()[0].date, ymd(2020, 2));
        let regs: Vec<f64> = series.points().iter().map(|p| p.regressors[0]).collect();
        assert_eq!(regs, vec![0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_interior_null_fails() {
        let rows = vec![
            row(ymd(2020, 1), Some(1.0), None),
            row(ymd(2020, 2), None, None),
            row(ymd(2020, 3), Some(2.0), None),
        ];
        let err = clean(UnitKey::new("Toronto", "price"), &["r".into()], rows).unwrap_err();
        assert_eq!(
            err,
            ForecastError::NonContiguousSeries {
                after: ymd(2020, 1),
                next: ymd(2020, 2)
            }
        );
    }

    #[test]
    fn test_calendar_gap_fails() {
        let rows = vec![row(ymd(2020, 1), Some(1.0), None), row(ymd(2020, 3), Some(2.0), None)];
        assert!(matches!(
            clean(UnitKey::new("Toronto", "price"), &["r".into()], rows),
            Err(ForecastError::NonContiguousSeries { .. })
        ));
    }

    #[test]
    fn test_all_null_is_empty_series() {
        let rows = vec![row(ymd(2020, 1), None, None)];
        let series = clean(UnitKey::new("Toronto", "price"), &["r".into()], rows).unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_read_enforces_minimum_and_discovers_units() {
        let store = Arc::new(MemoryFeatureStore::new());
        store.insert_column(
            "Ottawa",
            None,
            "rent_avg_city",
            (1..=6).map(|m| (ymd(2021, m), Some(1000.0 + m as f64))),
        );
        let reader = FeatureStoreReader::new(store);

        let units = reader
            .discover(&["price".to_string(), "rent".to_string()])
            .await
            .unwrap();
        assert_eq!(units.len(), 2);

        let unit = UnitKey::new("Ottawa", "rent");
        assert_eq!(reader.read(&unit, "rent_avg_city", &[], 6).await.unwrap().len(), 6);
        assert!(matches!(
            reader.read(&unit, "rent_avg_city", &[], 36).await,
            Err(ReadError::Series(ForecastError::InsufficientHistory { needed: 36, found: 6 }))
        ));
    }
}
