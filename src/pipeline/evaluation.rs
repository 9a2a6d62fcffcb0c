//! Accuracy of stored backtest rows, one comparison row per
//! (model, city, target, property type, horizon) group.

use chrono::Utc;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::domain::{ComparisonMetric, PredictionRecord};
use crate::forecast::metrics::{ForecastMetrics, MapeGuard};
use crate::repo::{ComparisonSink, PredictionSink, StoreError};

type GroupKey = (String, String, String, Option<String>, i32);
type RankKey = (String, String, Option<String>, i32);

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub rows_loaded: usize,
    pub metrics: Vec<ComparisonMetric>,
    pub rows_upserted: u64,
    /// Groups whose MAPE was omitted by the zero-denominator guard.
    pub mape_omitted: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationHarness {
    guard: MapeGuard,
}

impl EvaluationHarness {
    pub fn new(guard: MapeGuard) -> Self {
        Self { guard }
    }

    /// Metrics for every group of rows that carry ground truth, ranked by
    /// MAPE among the models of the same (city, target, property type,
    /// horizon). Rows without `y_true` are ignored.
    pub fn evaluate(&self, rows: &[PredictionRecord]) -> Vec<ComparisonMetric> {
        let evaluated_at = Utc::now();
        let groups = rows
            .iter()
            .filter(|r| r.y_true.is_some())
            .into_group_map_by(|r| -> GroupKey {
                (
                    r.model_name.clone(),
                    r.city.clone(),
                    r.target.clone(),
                    r.property_type.clone(),
                    r.horizon_months,
                )
            });

        let mut metrics: Vec<ComparisonMetric> = groups
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .filter_map(|((model_name, city, target, property_type, horizon), group)| {
                let actual: Vec<f64> = group.iter().filter_map(|r| r.y_true).collect();
                let predicted: Vec<f64> = group.iter().map(|r| r.yhat).collect();
                match ForecastMetrics::calculate(&actual, &predicted, self.guard) {
                    Ok(m) => Some(ComparisonMetric {
                        city,
                        target,
                        property_type,
                        horizon_months: horizon,
                        model_name,
                        mae: m.mae,
                        mape: m.mape,
                        rmse: m.rmse,
                        mse: m.mse,
                        r2: m.r2,
                        sample_count: m.sample_count as i64,
                        rank: None,
                        best_model: false,
                        evaluated_at,
                    }),
                    Err(e) => {
                        warn!(model = %model_name, city = %city, horizon, error = %e, "group not evaluated");
                        None
                    }
                }
            })
            .collect();

        rank_by_mape(&mut metrics);
        metrics
    }

    pub async fn evaluate_store(
        &self,
        predictions: &dyn PredictionSink,
        comparisons: &dyn ComparisonSink,
        model_names: &[String],
    ) -> Result<EvaluationReport, StoreError> {
        let rows = predictions.load_backtest_rows(model_names).await?;
        let metrics = self.evaluate(&rows);

        let mape_omitted = metrics.iter().filter(|m| m.mape.is_none()).count();
        if mape_omitted > 0 {
            warn!(groups = mape_omitted, "MAPE omitted where ground truth was zero");
        }
        let rows_upserted = comparisons.upsert_metrics(&metrics).await?;
        info!(
            models = ?model_names,
            rows = rows.len(),
            groups = metrics.len(),
            rows_upserted,
            "evaluation complete"
        );

        Ok(EvaluationReport {
            rows_loaded: rows.len(),
            metrics,
            rows_upserted,
            mape_omitted,
        })
    }
}

/// Dense rank by ascending MAPE; groups without a MAPE stay unranked.
fn rank_by_mape(metrics: &mut [ComparisonMetric]) {
    let mut peers: BTreeMap<RankKey, Vec<usize>> = BTreeMap::new();
    for (i, m) in metrics.iter().enumerate() {
        if m.mape.is_some() {
            peers
                .entry((
                    m.city.clone(),
                    m.target.clone(),
                    m.property_type.clone(),
                    m.horizon_months,
                ))
                .or_default()
                .push(i);
        }
    }

    for mut indices in peers.into_values() {
        indices.sort_by(|a, b| {
            let (a, b) = (metrics[*a].mape, metrics[*b].mape);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut rank = 0;
        let mut previous: Option<f64> = None;
        for i in indices {
            let mape = metrics[i].mape;
            if previous != mape {
                rank += 1;
                previous = mape;
            }
            metrics[i].rank = Some(rank);
            metrics[i].best_model = rank == 1;
        }
    }
}
