#![cfg(feature = "db")]

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DbConfig;

/// Postgres connection pool with retry logic and health checks
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect, retrying with exponential backoff, then verify the pool
    /// with a health check.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        info!("Initializing database connection pool");

        let pool = Self::connect_with_retry(config).await?;
        Self::ping(&pool).await?;

        info!(
            max_connections = config.max_connections,
            "Database connection pool initialized"
        );
        Ok(Self { pool })
    }

    async fn connect_with_retry(config: &DbConfig) -> Result<PgPool> {
        let max_attempts = config.connect_attempts.max(1);
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            attempt += 1;
            match Self::try_connect(config).await {
                Ok(pool) => return Ok(pool),
                Err(e) if attempt >= max_attempts => {
                    return Err(e).context(format!(
                        "Failed to connect to database after {} attempts",
                        max_attempts
                    ));
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        retry_in = ?delay,
                        "Database connection attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn try_connect(config: &DbConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to create database pool")?;

        Ok(pool)
    }

    async fn ping(pool: &PgPool) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        info!("Closing database connection pool");
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}
