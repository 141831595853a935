mod config;
mod data;
mod database;
mod engine;
mod error;
mod ml;
mod notifications;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{
    load_config, write_default_config, PipelineConfig, StoreBackend, StoreSettings, TrackingSettings,
};
use data::CsvObservationSource;
use database::SqliteTracker;
use engine::TrainingPipeline;
use ml::model::{format_params, ForestEstimator, ForestRegressor};
use ml::persistence::{FileModelStore, InMemoryModelStore, ModelStore, SledModelStore};
use ml::tracker::{AuditLog, ExperimentTracker, InMemoryTracker};
use ml::{FeatureBuilder, Forecaster, HyperparameterSearch, PromotionGate};
use notifications::{LogNotifier, NotificationManager, Notifier, TelegramNotifier};

const DEFAULT_CONFIG: &str = "pricecast.toml";

#[derive(Parser)]
#[command(name = "pricecast")]
#[command(version = "0.1.0")]
#[command(about = "Train, gate and serve hourly price forecasts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (default: pricecast.toml, optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one train → evaluate → promote cycle
    Train {
        /// CSV file with the price series (overrides data.input)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Forecast the next value with the current champion
    Predict,
    /// Show the current champion and the latest tracked run
    Status,
    /// Show recent promotion decisions
    History {
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
    /// Write the default configuration file
    InitConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    if cli.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Commands::InitConfig { output, force } = &cli.command {
        return init_config(output, *force);
    }

    let config = match &cli.config {
        Some(path) => load_config(path, true)?,
        None => load_config(Path::new(DEFAULT_CONFIG), false)?,
    };
    info!("pricecast v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Train { input } => train(&config, input).await?,
        Commands::Predict => predict(&config).await?,
        Commands::Status => show_status(&config).await?,
        Commands::History { limit } => show_history(&config, limit).await?,
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            output.display()
        ));
    }
    write_default_config(output)
}

fn open_store(settings: &StoreSettings) -> Result<Arc<dyn ModelStore<ForestRegressor>>> {
    let store: Arc<dyn ModelStore<ForestRegressor>> = match settings.backend {
        StoreBackend::File => Arc::new(
            FileModelStore::new(&settings.path).with_retain_versions(settings.retain_versions),
        ),
        StoreBackend::Sled => Arc::new(SledModelStore::open(&settings.path)?),
        StoreBackend::Memory => {
            warn!("Memory store selected: the champion is discarded on exit");
            Arc::new(InMemoryModelStore::new())
        }
    };
    Ok(store)
}

async fn open_tracking(
    settings: &TrackingSettings,
) -> Result<(Arc<dyn ExperimentTracker>, Arc<dyn AuditLog>)> {
    if settings.enabled {
        let sqlite = Arc::new(SqliteTracker::new(&settings.database_url, &settings.artifacts_dir).await?);
        let tracker: Arc<dyn ExperimentTracker> = sqlite.clone();
        let audit_log: Arc<dyn AuditLog> = sqlite;
        Ok((tracker, audit_log))
    } else {
        let memory = Arc::new(InMemoryTracker::new());
        let tracker: Arc<dyn ExperimentTracker> = memory.clone();
        let audit_log: Arc<dyn AuditLog> = memory;
        Ok((tracker, audit_log))
    }
}

fn build_notifier(config: &PipelineConfig) -> Result<Arc<dyn Notifier>> {
    let settings = &config.notifications;
    let notifier: Arc<dyn Notifier> = match (&settings.bot_token, &settings.chat_id) {
        (Some(token), Some(chat_id)) if settings.telegram_enabled => Arc::new(TelegramNotifier::new(
            token.clone(),
            chat_id.clone(),
            Duration::from_secs(settings.timeout_secs),
        )?),
        _ => Arc::new(LogNotifier),
    };
    Ok(notifier)
}

async fn train(config: &PipelineConfig, input: Option<PathBuf>) -> Result<()> {
    info!("═══════════════════════════════════════════════════");
    info!("Training run");
    info!("═══════════════════════════════════════════════════");

    let input = input.unwrap_or_else(|| config.data.input.clone());
    info!("Input: {}", input.display());
    info!(
        "Features: {} lags, rolling window {}",
        config.features.lag_count, config.features.rolling_window
    );

    let source = CsvObservationSource::new(input)
        .with_columns(&config.data.timestamp_column, &config.data.price_column);
    let builder = FeatureBuilder::new(config.features.lag_count, config.features.rolling_window)?;
    let search = HyperparameterSearch::new(
        config.search.grid.clone(),
        config.search.cv_folds,
        config.search.scoring,
    )
    .with_split(config.search.split_policy())
    .with_max_threads(config.search.max_threads);

    let store = open_store(&config.store)?;
    let (tracker, audit_log) = open_tracking(&config.tracking).await?;
    let notifications = Arc::new(NotificationManager::new(build_notifier(config)?));

    let pipeline = TrainingPipeline::new(
        ForestEstimator::new(config.search.seed),
        builder,
        search,
        store,
    )
    .with_tracking(tracker, audit_log)
    .with_notifications(notifications.clone())
    .with_experiment(config.tracking.experiment.clone());

    let report = tokio::select! {
        report = pipeline.run(&source) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; the champion store is only written by a completed promotion");
            return Err(anyhow!("training run interrupted"));
        }
    };

    if !report.succeeded() {
        return Err(anyhow!("training run failed: {}", report.audit.reason));
    }

    info!("Outcome: {}", report.audit.outcome.as_str());
    info!("Reason: {}", report.audit.reason);
    if let Some(params) = &report.best_params {
        info!("Best parameters: {}", format_params(params));
    }
    if let Some(version) = &report.audit.promoted_version {
        info!("✓ Champion is now v{}", version);
    }
    for notification in notifications.get_recent(1).await {
        info!("Notification {} sent: {}", notification.id, notification.alert_type.title());
    }
    Ok(())
}

async fn predict(config: &PipelineConfig) -> Result<()> {
    let store = open_store(&config.store)?;
    let forecast = Forecaster::new(store).forecast().await?;

    info!(
        "Champion v{} forecast from features as of {}",
        forecast.version, forecast.as_of
    );
    println!("{:.4}", forecast.value);
    Ok(())
}

async fn show_status(config: &PipelineConfig) -> Result<()> {
    let store = open_store(&config.store)?;
    let state = PromotionGate::new(store.clone()).state().await;
    info!("Gate state: {:?}", state);
    match store.get_pair().await? {
        Some(pair) => {
            let metrics = pair.artifact.metrics;
            info!("Champion: v{} ({})", pair.version, pair.artifact.estimator);
            info!("  Trained: {}", pair.artifact.created_at);
            info!("  Params: {}", format_params(&pair.artifact.params));
            info!(
                "  RMSE train/val: {:.4} / {:.4}   R² train/val: {:.4} / {:.4}",
                metrics.rmse_train, metrics.rmse_val, metrics.r2_train, metrics.r2_val
            );
            match pair.snapshot {
                Some(snapshot) => info!("  Snapshot as of {}", snapshot.timestamp),
                None => warn!("  No feature snapshot stored"),
            }
        }
        None => info!("No champion promoted yet"),
    }

    let (tracker, _) = open_tracking(&config.tracking).await?;
    match tracker.fetch_latest_run(config.tracking.experiment.clone()).await? {
        Some(run) => info!(
            "Latest run: {} at {} ({} artifacts)",
            run.run_id,
            run.created_at,
            run.artifacts.len()
        ),
        None => info!("No tracked runs for experiment '{}'", config.tracking.experiment),
    }
    Ok(())
}

async fn show_history(config: &PipelineConfig, limit: u32) -> Result<()> {
    let (_, audit_log) = open_tracking(&config.tracking).await?;
    let records = audit_log.recent_audits(limit).await?;
    if records.is_empty() {
        info!("No audit records");
        return Ok(());
    }

    for record in records {
        let rmse = |v: Option<f64>| v.map(|r| format!("{:.4}", r)).unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8}  candidate={}  champion={}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.outcome.as_str(),
            rmse(record.candidate_rmse),
            rmse(record.champion_rmse),
            record.reason
        );
    }
    Ok(())
}
