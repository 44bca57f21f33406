//! Scheduled actions: refresh data, refresh predictions, retrain.
//!
//! Every run gets an explicit [`UpdateContext`] holding its store, clients and
//! settings. Farms are processed one after another; a farm that fails is
//! logged and skipped so the others still update.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::api::{PowerClient, WeatherClient};
use crate::config::{AppConfig, Farm, UpdateConfig};
use crate::features::{FeatureRow, WeatherHour, impute_features, training_set};
use crate::model::{ModelError, ModelSet, PowerModel};
use crate::store::{PointUpdate, SeriesStore};
use crate::traits::{Clock, HourWindow};

/// Action requested by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    UpdateData,
    UpdatePred,
    Retrain,
}

impl Action {
    /// Parse a scheduler event name. Unknown events refresh data.
    pub fn from_event(event: &str) -> Self {
        match event {
            "updatePred" => Action::UpdatePred,
            "retrain" => Action::Retrain,
            _ => Action::UpdateData,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::UpdateData => "updateData",
            Action::UpdatePred => "updatePred",
            Action::Retrain => "retrain",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one run needs, passed in rather than held globally.
pub struct UpdateContext<S, C> {
    pub store: S,
    pub weather: WeatherClient,
    pub power: PowerClient,
    pub farms: Vec<Farm>,
    pub model_path: PathBuf,
    pub min_samples: usize,
    pub update: UpdateConfig,
    pub clock: C,
}

impl<S: SeriesStore, C: Clock> UpdateContext<S, C> {
    pub fn from_config(config: &AppConfig, store: S, clock: C) -> Result<Self> {
        Ok(Self {
            store,
            weather: WeatherClient::new(config.weather.api_url.clone(), &config.network)?,
            power: PowerClient::new(config.power.api_url.clone(), &config.network)?,
            farms: config.farms.clone(),
            model_path: config.model.path.clone(),
            min_samples: config.model.min_samples,
            update: config.update.clone(),
            clock,
        })
    }

    /// Saved models, or an empty set before the first retrain.
    fn load_models(&self) -> Result<ModelSet> {
        match ModelSet::load(&self.model_path) {
            Ok(models) => Ok(models),
            Err(ModelError::FileNotFound(path)) => {
                tracing::warn!("No trained models at {}, predictions will be skipped", path);
                Ok(ModelSet::new(self.clock.now_utc()))
            }
            Err(e) => Err(e).context("Failed to load models"),
        }
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub action: Action,
    pub started_at: DateTime<Utc>,
    pub runtime: Duration,
    pub farms_updated: usize,
    pub farms_failed: Vec<String>,
    pub points_written: usize,
    /// Hours left out because no prediction could be made for them.
    pub points_skipped: usize,
    /// Training samples per farm; only filled by retrain.
    pub samples: BTreeMap<String, usize>,
}

impl RunReport {
    fn new(action: Action, started_at: DateTime<Utc>) -> Self {
        Self {
            action,
            started_at,
            runtime: Duration::zero(),
            farms_updated: 0,
            farms_failed: Vec::new(),
            points_written: 0,
            points_skipped: 0,
            samples: BTreeMap::new(),
        }
    }

    fn record_farm(&mut self, outcome: FarmOutcome) {
        self.farms_updated += 1;
        self.points_written += outcome.written;
        self.points_skipped += outcome.skipped;
    }

    fn record_failure(&mut self, farm: &Farm, error: &anyhow::Error) {
        tracing::warn!("{} failed for {}: {:#}", self.action, farm.id, error);
        self.farms_failed.push(farm.id.clone());
    }

    /// Runtime as `HHH:MM:SS`.
    pub fn runtime_display(&self) -> String {
        let total = self.runtime.num_seconds().max(0);
        format!(
            "{:03}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }
}

/// Points written and skipped for one farm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FarmOutcome {
    written: usize,
    skipped: usize,
}

/// Clamped model output for one hour, if the weather supports a prediction.
fn predict_clamped(model: &PowerModel, features: Option<FeatureRow>) -> Option<f64> {
    features.map(|row| model.predict(&row).max(0.0))
}

/// `name=weight` pairs in model input order.
fn describe_weights(model: &PowerModel) -> String {
    FeatureRow::feature_names()
        .iter()
        .zip(&model.weights)
        .map(|(name, weight)| format!("{name}={weight:.3}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fetch weather and power for every farm and store them with fresh predictions.
pub async fn update_data<S: SeriesStore, C: Clock>(
    ctx: &UpdateContext<S, C>,
) -> Result<RunReport> {
    let started_at = ctx.clock.now_utc();
    let mut report = RunReport::new(Action::UpdateData, started_at);
    let models = ctx.load_models()?;

    let window = ctx
        .clock
        .fetch_window(ctx.update.history_days, ctx.update.horizon_days);
    tracing::debug!(
        "Update window {} .. {} ({} hours)",
        window.start,
        window.end,
        window.hours()
    );

    for farm in &ctx.farms {
        match update_farm_data(ctx, farm, models.get(&farm.id), window).await {
            Ok(outcome) => {
                tracing::info!(
                    "Updated {}: {} points, {} skipped",
                    farm.id,
                    outcome.written,
                    outcome.skipped
                );
                report.record_farm(outcome);
            }
            Err(e) => report.record_failure(farm, &e),
        }
    }

    Ok(report)
}

async fn update_farm_data<S: SeriesStore, C: Clock>(
    ctx: &UpdateContext<S, C>,
    farm: &Farm,
    model: Option<&PowerModel>,
    window: HourWindow,
) -> Result<FarmOutcome> {
    let weather = ctx
        .weather
        .fetch_hourly(farm, window.start, window.end)
        .await
        .context("Failed to fetch weather")?;

    if model.is_none() {
        tracing::warn!("No model for {}, storing weather without predictions", farm.id);
    }

    let hours: Vec<WeatherHour> = weather.iter().map(WeatherHour::from).collect();
    let features = impute_features(&hours);

    // With a model, an hour is stored only together with its prediction.
    let mut outcome = FarmOutcome::default();
    let mut predicted = BTreeSet::new();
    let mut weather_updates = Vec::with_capacity(weather.len());
    for (w, row) in weather.into_iter().zip(features) {
        let time = w.time;
        let update =
            PointUpdate::weather(time, w.temperature, w.wind_speed, w.wind_gust, w.icon);
        match model {
            None => weather_updates.push(update),
            Some(m) => match predict_clamped(m, row) {
                Some(p) => {
                    predicted.insert(time);
                    weather_updates.push(update.with_prediction(p));
                }
                None => {
                    tracing::debug!("No usable weather for {} at {}", farm.id, time);
                    outcome.skipped += 1;
                }
            },
        }
    }

    outcome.written = ctx.store.upsert(&farm.id, &weather_updates).await?;

    let power = ctx
        .power
        .fetch_hourly(farm, window.start, window.now)
        .await
        .context("Failed to fetch power")?;

    let (power_updates, unpredicted): (Vec<PointUpdate>, Vec<PointUpdate>) = power
        .into_iter()
        .filter(|p| window.is_past(p.time))
        .map(|p| PointUpdate::observation(p.time, p.power))
        .partition(|u| model.is_none() || predicted.contains(&u.timestamp));
    outcome.skipped += unpredicted.len();

    outcome.written += ctx.store.upsert(&farm.id, &power_updates).await?;

    Ok(outcome)
}

/// Re-predict every stored hour, writing only predictions.
///
/// Missing weather is filled from the neighbouring hours first.
pub async fn update_predictions<S: SeriesStore, C: Clock>(
    ctx: &UpdateContext<S, C>,
) -> Result<RunReport> {
    let mut report = RunReport::new(Action::UpdatePred, ctx.clock.now_utc());
    let models = ctx.load_models()?;
    if models.is_empty() {
        anyhow::bail!(
            "No trained models at {}; run retrain first",
            ctx.model_path.display()
        );
    }

    for farm in &ctx.farms {
        let Some(model) = models.get(&farm.id) else {
            tracing::warn!("No model for {}, skipping predictions", farm.id);
            continue;
        };

        match update_farm_predictions(ctx, farm, model).await {
            Ok(outcome) => {
                tracing::info!(
                    "Re-predicted {}: {} points, {} without weather",
                    farm.id,
                    outcome.written,
                    outcome.skipped
                );
                report.record_farm(outcome);
            }
            Err(e) => report.record_failure(farm, &e),
        }
    }

    Ok(report)
}

async fn update_farm_predictions<S: SeriesStore, C: Clock>(
    ctx: &UpdateContext<S, C>,
    farm: &Farm,
    model: &PowerModel,
) -> Result<FarmOutcome> {
    let mut records = ctx.store.fetch(&farm.id, None).await?;
    records.sort_by_key(|r| r.timestamp);

    let hours: Vec<WeatherHour> = records.iter().map(WeatherHour::from).collect();
    let mut outcome = FarmOutcome::default();
    let mut updates = Vec::with_capacity(records.len());
    for (record, row) in records.iter().zip(impute_features(&hours)) {
        match predict_clamped(model, row) {
            Some(p) => updates.push(PointUpdate::prediction(record.timestamp, p)),
            None => outcome.skipped += 1,
        }
    }

    outcome.written = ctx.store.upsert(&farm.id, &updates).await?;
    Ok(outcome)
}

/// Fit one model per farm on its observed hours and save the set.
///
/// Farms without enough data keep their previous model, if any.
pub async fn retrain<S: SeriesStore, C: Clock>(ctx: &UpdateContext<S, C>) -> Result<RunReport> {
    let started_at = ctx.clock.now_utc();
    let mut report = RunReport::new(Action::Retrain, started_at);
    let mut models = ctx.load_models()?;

    for farm in &ctx.farms {
        let records = match ctx.store.fetch_observed(&farm.id).await {
            Ok(records) => records,
            Err(e) => {
                report.record_failure(farm, &e);
                continue;
            }
        };

        let (features, targets) = training_set(&records);
        match PowerModel::fit(&features, &targets, ctx.min_samples) {
            Ok(model) => {
                tracing::info!(
                    "Trained {} on {} samples (mse={:.3})",
                    farm.id,
                    model.training_samples,
                    model.training_mse
                );
                tracing::debug!("{} weights: {}", farm.id, describe_weights(&model));
                report.samples.insert(farm.id.clone(), model.training_samples);
                report.farms_updated += 1;
                models.insert(&farm.id, model);
            }
            Err(ModelError::InsufficientData(n)) => {
                tracing::warn!(
                    "Skipping {}: {} samples, need at least {}",
                    farm.id,
                    n,
                    ctx.min_samples
                );
            }
            Err(e) => report.record_failure(farm, &anyhow::Error::new(e)),
        }
    }

    if report.farms_updated > 0 {
        models.created_at = started_at;
        models
            .save(&ctx.model_path)
            .with_context(|| format!("Failed to save models to {}", ctx.model_path.display()))?;
        tracing::info!("{}", models.summary());
    } else {
        tracing::warn!("No farm had enough data to train, models left unchanged");
    }

    Ok(report)
}

/// Run one action and time it.
pub async fn run_action<S: SeriesStore, C: Clock>(
    ctx: &UpdateContext<S, C>,
    action: Action,
) -> Result<RunReport> {
    tracing::info!("Running {}", action);

    let mut report = match action {
        Action::UpdateData => update_data(ctx).await?,
        Action::UpdatePred => update_predictions(ctx).await?,
        Action::Retrain => retrain(ctx).await?,
    };
    report.runtime = ctx.clock.now_utc() - report.started_at;

    tracing::info!(
        "{} finished in {}: {} farms, {} points, {} skipped, {} failed",
        action,
        report.runtime_display(),
        report.farms_updated,
        report.points_written,
        report.points_skipped,
        report.farms_failed.len()
    );

    Ok(report)
}
