use itertools::Itertools;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use super::PredictionSink;
use crate::domain::{PredictionKey, PredictionRecord};

/// A batch that did not commit, with the exact keys left unpersisted.
#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub index: usize,
    pub keys: Vec<PredictionKey>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertReport {
    pub rows_written: u64,
    pub committed_batches: usize,
    pub failed: Vec<FailedBatch>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Batched, idempotent writes into the predictions relation. A failing batch
/// is recorded and the remaining batches are still attempted; committed
/// batches stay committed.
#[derive(Clone)]
pub struct PredictionWriter {
    sink: Arc<dyn PredictionSink>,
    batch_size: usize,
}

impl PredictionWriter {
    pub fn new(sink: Arc<dyn PredictionSink>, batch_size: usize) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn upsert(&self, rows: &[PredictionRecord]) -> UpsertReport {
        let mut report = UpsertReport::default();
        for (index, batch) in rows.chunks(self.batch_size).enumerate() {
            match self.sink.upsert_batch(batch).await {
                Ok(written) => {
                    debug!(batch = index, rows = written, "batch committed");
                    report.rows_written += written;
                    report.committed_batches += 1;
                }
                Err(e) => {
                    let keys: Vec<PredictionKey> = batch.iter().map(PredictionRecord::key).collect();
                    error!(
                        batch = index,
                        rows = batch.len(),
                        keys = %keys.iter().join("; "),
                        error = %e,
                        "batch failed"
                    );
                    report.failed.push(FailedBatch {
                        index,
                        keys,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{MockPredictionSink, StoreError};
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn rows(n: usize) -> Vec<PredictionRecord> {
        let run_id = Uuid::new_v4();
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        (0..n)
            .map(|i| PredictionRecord {
                run_id,
                model_name: "arima_v4".into(),
                target: "price".into(),
                city: "Toronto".into(),
                property_type: None,
                horizon_months: i as i32 + 1,
                predict_date: crate::domain::add_months(start, i as u32),
                yhat: 1.0,
                yhat_lower: 0.5,
                yhat_upper: 1.5,
                y_true: None,
                features_version: "v1".into(),
                created_at: Utc::now(),
                is_micro: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failed_batch_reports_keys_and_continues() {
        let mut sink = MockPredictionSink::new();
        let mut call = 0;
        sink.expect_upsert_batch().times(3).returning(move |batch| {
            call += 1;
            if call == 2 {
                Err(StoreError::Unavailable("connection reset".into()))
            } else {
                Ok(batch.len() as u64)
            }
        });

        let writer = PredictionWriter::new(Arc::new(sink), 4);
        let input = rows(10);
        let report = writer.upsert(&input).await;

        assert_eq!(report.rows_written, 6);
        assert_eq!(report.committed_batches, 2);
        assert_eq!(report.failed.len(), 1);
        let failed = &report.failed[0];
        assert_eq!(failed.index, 1);
        assert_eq!(failed.keys.len(), 4);
        assert_eq!(failed.keys[0], input[4].key());
        assert!(failed.error.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_empty_input_touches_nothing() {
        let mut sink = MockPredictionSink::new();
        sink.expect_upsert_batch().never();
        let report = PredictionWriter::new(Arc::new(sink), 100).upsert(&[]).await;
        assert!(report.is_complete());
        assert_eq!(report.rows_written, 0);
    }
}
