#![cfg(feature = "db")]

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

use crate::config::{DbConfig, SourceConfig};
use crate::database::Database;

pub mod comparison;
pub mod features;
pub mod predictions;

pub use comparison::PgComparisonStore;
pub use features::PgFeatureStore;
pub use predictions::PgPredictionStore;

const SCHEMA: &str = include_str!("../../migrations/0001_forecast_tables.sql");

/// Owns the pool; hands out stores that share it.
pub struct PgRepo {
    db: Database,
}

impl PgRepo {
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        Ok(Self {
            db: Database::connect(cfg).await?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    /// Creates the output relations and their conflict keys if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(self.pool())
            .await
            .context("Failed to apply forecast schema")?;
        info!("forecast schema is up to date");
        Ok(())
    }

    pub fn features(&self, source: &SourceConfig) -> Result<PgFeatureStore> {
        Ok(PgFeatureStore::new(self.pool().clone(), source)?)
    }

    pub fn predictions(&self) -> PgPredictionStore {
        PgPredictionStore::new(self.pool().clone())
    }

    pub fn comparisons(&self) -> PgComparisonStore {
        PgComparisonStore::new(self.pool().clone())
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}
