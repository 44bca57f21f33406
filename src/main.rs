use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use wind_forecast::{
    Action, AppConfig, Clock, Database, HistoryRange, PowerClient, RunReport, SeriesStore,
    SystemClock, UpdateContext, chart, into_ascending, round2, run_action, split_series,
};

#[derive(Parser, Debug)]
#[command(name = "wind-forecast")]
#[command(about = "Hourly wind power forecasts for South Australian wind farms")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch weather and power, store both with fresh predictions
    UpdateData,
    /// Re-predict every stored hour with the current models
    UpdatePred,
    /// Fit a model per farm on all observed hours
    Retrain,
    /// Run the action named by a scheduler event (updatePred, retrain, anything else updates data)
    Run {
        #[arg(long)]
        action: String,
    },
    /// Run headless: update data every interval and retrain periodically
    Daemon,
    /// Print a farm's forecast, observed history and current conditions
    Show {
        #[arg(long)]
        farm: String,
        /// 2d, week, month, 3months, 6months, year or all
        #[arg(long)]
        range: Option<HistoryRange>,
    },
    /// Export a farm's full series to CSV
    Export {
        #[arg(long)]
        farm: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Print the current output of every configured farm
    Current,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy(
            std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "wind_forecast=debug".into()),
        );

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let config = Arc::new(config);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(async {
        match args.command {
            Command::UpdateData => run_once(&config, Action::UpdateData).await.map(drop),
            Command::UpdatePred => run_once(&config, Action::UpdatePred).await.map(drop),
            Command::Retrain => run_once(&config, Action::Retrain).await.map(drop),
            Command::Run { action } => {
                run_once(&config, Action::from_event(&action)).await.map(drop)
            }
            Command::Daemon => run_daemon(config).await,
            Command::Show { farm, range } => show(&config, &farm, range).await,
            Command::Export { farm, dir } => export(&config, &farm, &dir).await,
            Command::Current => current(&config).await,
        }
    })
}

/// One scheduled run: open the database, run the action, close it again.
async fn run_once(config: &AppConfig, action: Action) -> Result<RunReport> {
    tracing::info!("Connecting to database...");
    let database = Database::new(&config.database.url).await?;

    let ctx = UpdateContext::from_config(config, database.clone(), SystemClock)?;
    let result = run_action(&ctx, action).await;

    database.close().await;
    result
}

/// Run in daemon mode - data every interval, retrain when due
async fn run_daemon(config: Arc<AppConfig>) -> Result<()> {
    tracing::info!("Starting Wind Forecast in daemon mode");

    let interval_secs = config.update.data_interval_secs;
    let retrain_every = chrono::Duration::hours(config.update.retrain_interval_hours as i64);
    tracing::info!(
        "Starting update loop: data every {} seconds, retrain every {} hours",
        interval_secs,
        config.update.retrain_interval_hours
    );

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_retrain: Option<DateTime<Utc>> = None;

    loop {
        interval.tick().await;

        if let Err(e) = run_once(&config, Action::UpdateData).await {
            tracing::error!("Data update failed: {:#}", e);
            continue;
        }

        let now = SystemClock.now_utc();
        if last_retrain.is_none_or(|at| now - at >= retrain_every) {
            match run_once(&config, Action::Retrain).await {
                Ok(_) => last_retrain = Some(now),
                Err(e) => tracing::error!("Retrain failed: {:#}", e),
            }
        }

        if let Err(e) = run_once(&config, Action::UpdatePred).await {
            tracing::warn!("Prediction update failed: {:#}", e);
        }
    }
}

async fn show(config: &AppConfig, farm_id: &str, range: Option<HistoryRange>) -> Result<()> {
    let farm = config
        .farm(farm_id)
        .with_context(|| format!("Unknown farm: {farm_id}"))?
        .clone();
    let limit = match range {
        Some(range) => range.hours(),
        None => Some(config.dashboard.default_range_hours),
    };

    let database = Database::new(&config.database.url).await?;
    let records = database.fetch(&farm.id, limit).await;
    database.close().await;

    let points = into_ascending(records?).context("Stored series is malformed")?;
    let split = split_series(&points).with_context(|| format!("No data for {}", farm.id))?;
    let forecast = chart::forecast_chart(&points)?;
    let weather = chart::weather_chart(&points)?;

    println!("{}", chart::plot_title(&farm.name));
    println!(
        "{} observed hours, {} forecast hours{}",
        split.observed_len(),
        split.forecast_len(),
        if split.has_gaps { " (history has gaps)" } else { "" }
    );
    println!(
        "Forecast starts at {}",
        split.transition.timestamp.format("%Y-%m-%d %H:%M UTC")
    );

    if let Some(conditions) = chart::current_conditions(&points) {
        println!("Current conditions [{}]: {}", conditions.icon, conditions.describe());
    }

    let lines = forecast
        .lines()
        .into_iter()
        .chain(&weather.wind_panel)
        .chain(&weather.temperature_panel);
    for line in lines {
        let values: Vec<f64> = line.values().collect();
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if values.is_empty() {
            println!("  {:<22} {:?}, no values", line.name, line.style);
        } else {
            println!(
                "  {:<22} {:?}, {} values, {:.2}..{:.2}",
                line.name,
                line.style,
                values.len(),
                min,
                max
            );
        }
    }

    println!();
    println!(
        "{:<17} {:>10} {:>10} {:>8} {:>8} {:>8}  phase",
        "time (UTC)", "predicted", "actual", "wind", "gust", "temp"
    );
    let cell = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", round2(v)));
    for (i, point) in points.iter().enumerate() {
        let phase = if i < split.boundary_index { "observed" } else { "forecast" };
        println!(
            "{:<17} {:>10} {:>10} {:>8} {:>8} {:>8}  {}",
            point.timestamp.format("%Y-%m-%d %H:%M"),
            cell(Some(point.prediction)),
            cell(point.actual),
            cell(point.wind_speed),
            cell(point.wind_gust),
            cell(point.temperature),
            phase
        );
    }

    Ok(())
}

async fn export(config: &AppConfig, farm_id: &str, dir: &std::path::Path) -> Result<()> {
    let farm = config
        .farm(farm_id)
        .with_context(|| format!("Unknown farm: {farm_id}"))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let database = Database::new(&config.database.url).await?;
    let result = database.export_to_csv(&farm.id, dir, &SystemClock).await;
    database.close().await;

    let path = result?;
    tracing::info!("Exported {} to {}", farm.id, path.display());
    println!("{}", path.display());
    Ok(())
}

async fn current(config: &AppConfig) -> Result<()> {
    let client = PowerClient::new(config.power.api_url.clone(), &config.network)?;
    let readings = client.fetch_current().await?;

    for output in chart::farm_outputs(&readings, &config.farms) {
        println!(
            "{:<10} {:<24} {:>8.1} MW  ({:.2}, {:.2})",
            output.farm.id,
            output.station_name,
            output.output_mw,
            output.farm.latitude,
            output.farm.longitude
        );
    }

    Ok(())
}
