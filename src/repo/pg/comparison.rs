use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::ComparisonMetric;
use crate::repo::{ComparisonSink, StoreError};

pub struct PgComparisonStore {
    pool: PgPool,
}

impl PgComparisonStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ComparisonSink for PgComparisonStore {
    async fn upsert_metrics(&self, rows: &[ComparisonMetric]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        // 14 binds per row, at most 28k binds per statement
        for chunk in rows.chunks(2000) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO model_comparison \
                 (city, target, property_type, horizon_months, model_name, mae, mape, rmse, mse, \
                  r2, sample_count, rank, best_model, evaluated_at) ",
            );
            builder.push_values(chunk, |mut b, m| {
                b.push_bind(&m.city)
                    .push_bind(&m.target)
                    .push_bind(m.property_type.as_deref())
                    .push_bind(m.horizon_months)
                    .push_bind(&m.model_name)
                    .push_bind(m.mae)
                    .push_bind(m.mape)
                    .push_bind(m.rmse)
                    .push_bind(m.mse)
                    .push_bind(m.r2)
                    .push_bind(m.sample_count)
                    .push_bind(m.rank)
                    .push_bind(m.best_model)
                    .push_bind(m.evaluated_at);
            });
            builder.push(
                " ON CONFLICT ON CONSTRAINT model_comparison_conflict_key DO UPDATE SET \
                 mae = EXCLUDED.mae, mape = EXCLUDED.mape, rmse = EXCLUDED.rmse, \
                 mse = EXCLUDED.mse, r2 = EXCLUDED.r2, sample_count = EXCLUDED.sample_count, \
                 rank = EXCLUDED.rank, best_model = EXCLUDED.best_model, \
                 evaluated_at = EXCLUDED.evaluated_at",
            );
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }
}
