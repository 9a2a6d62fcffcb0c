//! In-process stores with the same conflict-key semantics as the Postgres
//! relations. Used by `--dry-run` and the test suite.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

use super::{ComparisonSink, FeatureRow, FeatureStore, PredictionSink, StoreError};
use crate::domain::{
    ComparisonKey, ComparisonMetric, PredictionKey, PredictionRecord, Series, UnitKey,
};

type UnitRows = BTreeMap<NaiveDate, HashMap<String, Option<f64>>>;

#[derive(Default)]
pub struct MemoryFeatureStore {
    units: RwLock<BTreeMap<(String, Option<String>), UnitRows>>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `column` for the given (city, property_type) at each date.
    pub fn insert_column(
        &self,
        city: &str,
        property_type: Option<&str>,
        column: &str,
        cells: impl IntoIterator<Item = (NaiveDate, Option<f64>)>,
    ) {
        let mut units = self.units.write();
        let rows = units
            .entry((city.to_string(), property_type.map(str::to_string)))
            .or_default();
        for (date, value) in cells {
            rows.entry(date)
                .or_default()
                .insert(column.to_string(), value);
        }
    }

    /// Writes a clean series back as columns: the target under `column` and
    /// each regressor under its own name.
    pub fn insert_series(&self, series: &Series, column: &str) {
        let key = &series.key;
        let pt = key.property_type.as_deref();
        self.insert_column(
            &key.city,
            pt,
            column,
            series.points().iter().map(|p| (p.date, Some(p.value))),
        );
        for (i, name) in series.regressor_names().iter().enumerate() {
            self.insert_column(
                &key.city,
                pt,
                name,
                series.points().iter().map(|p| (p.date, Some(p.regressors[i]))),
            );
        }
    }

    fn has_column(&self, column: &str) -> bool {
        self.units
            .read()
            .values()
            .flat_map(|rows| rows.values())
            .any(|cells| cells.contains_key(column))
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn discover_units(&self) -> Result<Vec<(String, Option<String>)>, StoreError> {
        Ok(self.units.read().keys().cloned().collect())
    }

    async fn fetch_rows(
        &self,
        unit: &UnitKey,
        column: &str,
        regressors: &[String],
    ) -> Result<Vec<FeatureRow>, StoreError> {
        for name in std::iter::once(column).chain(regressors.iter().map(String::as_str)) {
            if !self.has_column(name) {
                return Err(StoreError::Schema(format!("column {name} does not exist")));
            }
        }
        let units = self.units.read();
        let Some(rows) = units.get(&(unit.city.clone(), unit.property_type.clone())) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .map(|(date, cells)| FeatureRow {
                date: *date,
                value: cells.get(column).copied().flatten(),
                regressors: regressors
                    .iter()
                    .map(|r| cells.get(r).copied().flatten())
                    .collect(),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPredictionStore {
    rows: Mutex<BTreeMap<PredictionKey, PredictionRecord>>,
}

impl MemoryPredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Snapshot ordered by conflict key.
    pub fn rows(&self) -> Vec<PredictionRecord> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait]
impl PredictionSink for MemoryPredictionStore {
    async fn upsert_batch(&self, rows: &[PredictionRecord]) -> Result<u64, StoreError> {
        let mut stored = self.rows.lock();
        for row in rows {
            stored.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn load_backtest_rows(
        &self,
        model_names: &[String],
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| r.y_true.is_some() && model_names.contains(&r.model_name))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryComparisonStore {
    rows: Mutex<BTreeMap<ComparisonKey, ComparisonMetric>>,
}

impl MemoryComparisonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ComparisonMetric> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ComparisonSink for MemoryComparisonStore {
    async fn upsert_metrics(&self, rows: &[ComparisonMetric]) -> Result<u64, StoreError> {
        let mut stored = self.rows.lock();
        for row in rows {
            stored.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }
}
