//! Runs one model family over many units.
//!
//! Every unit ends in exactly one `UnitOutcome` per stage. Skippable
//! conditions and failures are caught at the unit boundary, so one unit can
//! never stop its siblings. CPU work runs on the blocking pool behind a
//! semaphore sized for the family.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Instrument};

use super::{
    BacktestSettings, Backtester, FeatureStoreReader, ProductionRunner, ProductionSettings,
    ReadError,
};
use crate::config::{Config, SourceConfig};
use crate::domain::{PredictionRecord, Series, UnitKey};
use crate::error::ForecastError;
use crate::forecast::{Family, Forecaster};
use crate::repo::{FailedBatch, PredictionWriter};

pub const PREDICTIONS_RELATION: &str = "model_predictions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Backtest,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub backtest: bool,
    pub production: bool,
}

impl Stages {
    pub fn all() -> Self {
        Self {
            backtest: true,
            production: true,
        }
    }

    fn selected(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(2);
        if self.backtest {
            stages.push(Stage::Backtest);
        }
        if self.production {
            stages.push(Stage::Production);
        }
        stages
    }
}

impl Default for Stages {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed { rows: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: UnitKey,
    pub model_name: String,
    pub stage: Stage,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    CompletedWithSkips,
    Fatal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::CompletedWithSkips => 3,
            ExitStatus::Fatal => 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub reports: Vec<UnitReport>,
    /// Rows upserted per destination relation.
    pub rows_upserted: BTreeMap<String, u64>,
    pub failed_batches: Vec<FailedBatch>,
}

impl RunSummary {
    fn count(&self, f: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed { .. }))
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.failed() > 0 || !self.failed_batches.is_empty() {
            ExitStatus::Fatal
        } else if self.skipped() > 0 {
            ExitStatus::CompletedWithSkips
        } else {
            ExitStatus::Clean
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.reports.extend(other.reports);
        for (relation, rows) in other.rows_upserted {
            *self.rows_upserted.entry(relation).or_default() += rows;
        }
        self.failed_batches.extend(other.failed_batches);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<40} {:<20} {:<10} {:<9} detail", "unit", "model", "stage", "status")?;
        let mut reports: Vec<&UnitReport> = self.reports.iter().collect();
        reports.sort_by(|a, b| (&a.unit, a.stage).cmp(&(&b.unit, b.stage)));
        for r in reports {
            let (status, detail) = match &r.outcome {
                UnitOutcome::Completed { rows } => ("ok", format!("{rows} rows")),
                UnitOutcome::Skipped { reason } => ("skipped", reason.clone()),
                UnitOutcome::Failed { error } => ("FAILED", error.clone()),
            };
            writeln!(
                f,
                "{:<40} {:<20} {:<10} {:<9} {detail}",
                r.unit.to_string(),
                r.model_name,
                r.stage.to_string(),
                status
            )?;
        }
        for (relation, rows) in &self.rows_upserted {
            writeln!(f, "{relation}: {rows} rows upserted")?;
        }
        for batch in &self.failed_batches {
            writeln!(
                f,
                "batch {} not persisted ({} keys): {}",
                batch.index,
                batch.keys.len(),
                batch.error
            )?;
            for key in &batch.keys {
                writeln!(f, "  {key}")?;
            }
        }
        write!(
            f,
            "{} completed, {} skipped, {} failed",
            self.completed(),
            self.skipped(),
            self.failed()
        )
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backtest: BacktestSettings,
    pub production: ProductionSettings,
    pub source: SourceConfig,
    pub max_workers: usize,
    pub unit_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config, family: Family) -> Self {
        Self {
            backtest: BacktestSettings::from_config(config),
            production: ProductionSettings::from_config(config),
            source: config.source.clone(),
            max_workers: family.worker_limit(&config.runtime).max(1),
            unit_timeout: config.runtime.unit_timeout(),
        }
    }
}

pub struct Orchestrator {
    reader: FeatureStoreReader,
    writer: PredictionWriter,
    forecaster: Arc<dyn Forecaster>,
    settings: EngineSettings,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        reader: FeatureStoreReader,
        writer: PredictionWriter,
        forecaster: Arc<dyn Forecaster>,
        settings: EngineSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_workers));
        Self {
            reader,
            writer,
            forecaster,
            settings,
            permits,
        }
    }

    pub async fn run(&self, units: Vec<UnitKey>, stages: Stages) -> RunSummary {
        info!(
            model = self.forecaster.name(),
            units = units.len(),
            workers = self.settings.max_workers,
            "run started"
        );
        let concurrency = self.settings.max_workers * 2;
        let summaries: Vec<RunSummary> = stream::iter(units)
            .map(|unit| {
                let span = tracing::info_span!("unit", unit = %unit, model = self.forecaster.name());
                self.run_unit(unit, stages).instrument(span)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for unit_summary in summaries {
            summary.merge(unit_summary);
        }
        summary.rows_upserted.entry(PREDICTIONS_RELATION.to_string()).or_default();
        info!(
            completed = summary.completed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            failed_batches = summary.failed_batches.len(),
            "run finished"
        );
        summary
    }

    async fn run_unit(&self, unit: UnitKey, stages: Stages) -> RunSummary {
        let stages = stages.selected();
        let mut summary = RunSummary::default();

        let series = match self.load(&unit).await {
            Ok(series) => Arc::new(series),
            Err(outcome) => {
                for stage in stages {
                    summary.reports.push(self.report(&unit, stage, outcome.clone()));
                }
                return summary;
            }
        };

        for stage in stages {
            let outcome = match self.compute(stage, series.clone()).await {
                Ok(rows) => self.persist(&rows, &mut summary).await,
                Err(outcome) => outcome,
            };
            summary.reports.push(self.report(&unit, stage, outcome));
        }
        summary
    }

    async fn load(&self, unit: &UnitKey) -> Result<Series, UnitOutcome> {
        let Some(column) = self.settings.source.column_for(&unit.target) else {
            return Err(UnitOutcome::Failed {
                error: format!("no source column configured for target {}", unit.target),
            });
        };
        let series = self
            .reader
            .read(
                unit,
                column,
                self.forecaster.required_regressors(),
                self.forecaster.min_history(),
            )
            .await
            .map_err(|e| match e {
                ReadError::Series(e) => classify(e),
                ReadError::Store(e) => UnitOutcome::Failed {
                    error: e.to_string(),
                },
            })?;
        if series.history().is_degenerate() {
            return Err(classify(ForecastError::DegenerateSeries));
        }
        Ok(series)
    }

    /// Fits and predicts on the blocking pool under a worker permit and the
    /// unit timeout. A timed-out computation keeps its permit until the
    /// blocking thread returns.
    async fn compute(
        &self,
        stage: Stage,
        series: Arc<Series>,
    ) -> Result<Vec<PredictionRecord>, UnitOutcome> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| UnitOutcome::Failed {
                error: e.to_string(),
            })?;

        let forecaster = self.forecaster.clone();
        let backtest = self.settings.backtest.clone();
        let production = self.settings.production.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match stage {
                Stage::Backtest => Backtester::new(forecaster, backtest).run(&series),
                Stage::Production => ProductionRunner::new(forecaster, production).run(&series),
            }
        });

        match tokio::time::timeout(self.settings.unit_timeout, task).await {
            Err(_) => Err(classify(ForecastError::Timeout(self.settings.unit_timeout))),
            Ok(Err(join)) => Err(UnitOutcome::Failed {
                error: format!("unit task aborted: {join}"),
            }),
            Ok(Ok(Err(e))) => Err(classify(e)),
            Ok(Ok(Ok(rows))) => Ok(rows),
        }
    }

    async fn persist(&self, rows: &[PredictionRecord], summary: &mut RunSummary) -> UnitOutcome {
        let report = self.writer.upsert(rows).await;
        *summary
            .rows_upserted
            .entry(PREDICTIONS_RELATION.to_string())
            .or_default() += report.rows_written;
        if report.is_complete() {
            return UnitOutcome::Completed { rows: rows.len() };
        }
        let outcome = UnitOutcome::Failed {
            error: format!(
                "{} of {} batches not persisted",
                report.failed.len(),
                report.failed.len() + report.committed_batches
            ),
        };
        summary.failed_batches.extend(report.failed);
        outcome
    }

    fn report(&self, unit: &UnitKey, stage: Stage, outcome: UnitOutcome) -> UnitReport {
        let model_name = match stage {
            Stage::Backtest => super::backtest_model_name(self.forecaster.name()),
            Stage::Production => self.forecaster.name().to_string(),
        };
        match &outcome {
            UnitOutcome::Completed { rows } => info!(%stage, model = %model_name, rows, "unit completed"),
            UnitOutcome::Skipped { reason } => warn!(%stage, model = %model_name, reason = %reason, "unit skipped"),
            UnitOutcome::Failed { error } => error!(%stage, model = %model_name, error = %error, "unit failed"),
        }
        UnitReport {
            unit: unit.clone(),
            model_name,
            stage,
            outcome,
        }
    }
}

fn classify(error: ForecastError) -> UnitOutcome {
    if error.is_skippable() {
        UnitOutcome::Skipped {
            reason: error.to_string(),
        }
    } else {
        UnitOutcome::Failed {
            error: error.to_string(),
        }
    }
}
