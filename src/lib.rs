//! Housing forecast engine.
//!
//! Trains interchangeable forecasting families on monthly city-level series,
//! validates them with walk-forward backtests, produces production forecasts
//! with bounds and scores every family on common error metrics.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod ml;
pub mod pipeline;
pub mod repo;
pub mod telemetry;

pub use error::ForecastError;
