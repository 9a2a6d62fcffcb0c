use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{error, info, warn};

use housing_forecast_engine::config::Config;
use housing_forecast_engine::forecast::metrics::MapeGuard;
use housing_forecast_engine::forecast::{build_forecaster, Family};
use housing_forecast_engine::pipeline::{
    backtest_model_name, EngineSettings, EvaluationHarness, ExitStatus, FeatureStoreReader,
    Orchestrator, Stages,
};
use housing_forecast_engine::repo::memory::MemoryPredictionStore;
use housing_forecast_engine::repo::pg::PgRepo;
use housing_forecast_engine::repo::{PredictionSink, PredictionWriter};
use housing_forecast_engine::telemetry::{init_tracing, shutdown_signal};

#[derive(Parser)]
#[command(name = "hfe", version)]
#[command(about = "Backtests, forecasts and scores city-level housing series", long_about = None)]
struct Cli {
    /// Configuration file layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Human readable logs instead of JSON lines
    #[arg(long, global = true)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Autoregressive model with native intervals
    Arima(RunArgs),
    /// Trend, seasonality and regressors
    Additive(RunArgs),
    /// Gradient boosted trees with quantile bounds
    Gbt(RunArgs),
    /// Recurrent network with a fixed band
    Rnn(RunArgs),
    /// Score stored backtest rows into the comparison relation
    Evaluate(EvaluateArgs),
    /// Create the output relations
    Migrate,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, conflicts_with = "production_only")]
    backtest_only: bool,

    #[arg(long)]
    production_only: bool,

    /// Restrict to these cities (repeatable)
    #[arg(long = "city")]
    cities: Vec<String>,

    /// Restrict to these targets (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    #[arg(long)]
    property_type: Option<String>,

    /// Read features but keep predictions in memory
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Model names to score (repeatable); defaults to every configured family
    #[arg(long = "model")]
    models: Vec<String>,

    /// Also write the comparison rows as JSON
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.plain_logs);

    match run(cli).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            error!(error = %format!("{e:#}"), "run aborted");
            eprintln!("error: {e:#}");
            ExitCode::from(ExitStatus::Fatal.code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = Config::load(cli.config.as_deref())?;
    let repo = PgRepo::connect(&config.db).await?;

    let result = tokio::select! {
        result = dispatch(&repo, &config, cli.command) => result,
        _ = shutdown_signal() => {
            warn!("interrupted; committed batches stay committed");
            Ok(ExitStatus::Fatal)
        }
    };

    repo.close().await;
    result
}

async fn dispatch(repo: &PgRepo, config: &Config, command: Command) -> Result<ExitStatus> {
    match command {
        Command::Migrate => {
            repo.ensure_schema().await?;
            Ok(ExitStatus::Clean)
        }
        Command::Evaluate(args) => evaluate(repo, config, args).await,
        Command::Arima(args) => forecast(repo, config, Family::Arima, args).await,
        Command::Additive(args) => forecast(repo, config, Family::Additive, args).await,
        Command::Gbt(args) => forecast(repo, config, Family::Gbt, args).await,
        Command::Rnn(args) => forecast(repo, config, Family::Rnn, args).await,
    }
}

async fn forecast(repo: &PgRepo, config: &Config, family: Family, args: RunArgs) -> Result<ExitStatus> {
    let forecaster = build_forecaster(family, &config.models, &config.intervals)
        .with_context(|| format!("invalid {family} configuration"))?;

    let sink: Arc<dyn PredictionSink> = if args.dry_run {
        Arc::new(MemoryPredictionStore::new())
    } else {
        repo.ensure_schema().await?;
        Arc::new(repo.predictions())
    };

    let reader = FeatureStoreReader::new(Arc::new(repo.features(&config.source)?));
    let targets: Vec<String> = if args.targets.is_empty() {
        config.source.targets.keys().cloned().collect()
    } else {
        args.targets.clone()
    };
    let units: Vec<_> = reader
        .discover(&targets)
        .await
        .context("unit discovery failed")?
        .into_iter()
        .filter(|u| args.cities.is_empty() || args.cities.contains(&u.city))
        .filter(|u| {
            args.property_type
                .as_ref()
                .map_or(true, |pt| u.property_type.as_ref() == Some(pt))
        })
        .collect();
    if units.is_empty() {
        warn!(model = family.model_name(&config.models), "no units selected");
    }

    let stages = Stages {
        backtest: !args.production_only,
        production: !args.backtest_only,
    };
    let orchestrator = Orchestrator::new(
        reader,
        PredictionWriter::new(sink, config.runtime.batch_size),
        forecaster,
        EngineSettings::from_config(config, family),
    );
    let summary = orchestrator.run(units, stages).await;

    println!("{summary}");
    if args.dry_run {
        println!("dry run: predictions were not persisted");
    }
    Ok(summary.exit_status())
}

async fn evaluate(repo: &PgRepo, config: &Config, args: EvaluateArgs) -> Result<ExitStatus> {
    repo.ensure_schema().await?;

    let models: Vec<String> = if args.models.is_empty() {
        Family::iter()
            .map(|f| backtest_model_name(f.model_name(&config.models)))
            .collect()
    } else {
        args.models
            .iter()
            .map(|m| {
                if m.ends_with("_backtest") {
                    m.clone()
                } else {
                    backtest_model_name(m)
                }
            })
            .collect()
    };

    let harness = EvaluationHarness::new(MapeGuard {
        zero_epsilon: config.evaluation.mape_zero_epsilon,
    });
    let report = harness
        .evaluate_store(&repo.predictions(), &repo.comparisons(), &models)
        .await
        .context("evaluation failed")?;

    if let Some(path) = &args.export {
        let json = serde_json::to_string_pretty(&report.metrics)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), rows = report.metrics.len(), "comparison exported");
    }

    println!(
        "model_comparison: {} rows upserted from {} backtest rows ({} groups without MAPE)",
        report.rows_upserted, report.rows_loaded, report.mape_omitted
    );
    if report.rows_loaded == 0 {
        warn!(models = ?models, "no backtest rows found");
        return Ok(ExitStatus::CompletedWithSkips);
    }
    Ok(ExitStatus::Clean)
}
