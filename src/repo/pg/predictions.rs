use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::PredictionRecord;
use crate::repo::{PredictionSink, StoreError};

const INSERT_PREFIX: &str = "INSERT INTO model_predictions \
    (run_id, model_name, target, city, property_type, horizon_months, predict_date, \
     yhat, yhat_lower, yhat_upper, y_true, features_version, created_at, is_micro) ";

const ON_CONFLICT: &str = " ON CONFLICT ON CONSTRAINT model_predictions_conflict_key DO UPDATE SET \
    run_id = EXCLUDED.run_id, \
    yhat = EXCLUDED.yhat, \
    yhat_lower = EXCLUDED.yhat_lower, \
    yhat_upper = EXCLUDED.yhat_upper, \
    y_true = EXCLUDED.y_true, \
    features_version = EXCLUDED.features_version, \
    is_micro = EXCLUDED.is_micro, \
    created_at = now()";

pub struct PgPredictionStore {
    pool: PgPool,
}

impl PgPredictionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PredictionSink for PgPredictionStore {
    /// One multi-row upsert inside its own transaction. The pooled connection
    /// is returned when the transaction is committed or dropped.
    async fn upsert_batch(&self, rows: &[PredictionRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let mut builder = QueryBuilder::<Postgres>::new(INSERT_PREFIX);
        builder.push_values(rows, |mut b, r| {
            b.push_bind(r.run_id)
                .push_bind(&r.model_name)
                .push_bind(&r.target)
                .push_bind(&r.city)
                .push_bind(r.property_type.as_deref())
                .push_bind(r.horizon_months)
                .push_bind(r.predict_date)
                .push_bind(r.yhat)
                .push_bind(r.yhat_lower)
                .push_bind(r.yhat_upper)
                .push_bind(r.y_true)
                .push_bind(&r.features_version)
                .push_bind(r.created_at)
                .push_bind(r.is_micro);
        });
        builder.push(ON_CONFLICT);

        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn load_backtest_rows(
        &self,
        model_names: &[String],
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PredictionRecord>(
            r#"
            SELECT run_id, model_name, target, city, property_type, horizon_months,
                   predict_date, yhat, yhat_lower, yhat_upper, y_true,
                   features_version, created_at, is_micro
            FROM model_predictions
            WHERE y_true IS NOT NULL AND model_name = ANY($1)
            ORDER BY model_name, city, target, property_type, predict_date
            "#,
        )
        .bind(model_names)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
