//! End-to-end update cycle against mock data sources.
//!
//! Runs update-data, retrain and update-pred over an in-memory store with a
//! fixed clock, then reads the series back the way the dashboard does.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use wind_forecast::{
    Action, MemoryStore, MockClock, SeriesStore, UpdateContext, current_conditions,
    forecast_chart, into_ascending, run_action, split_series,
    api::{PowerClient, WeatherClient},
    config::{Farm, NetworkConfig, UpdateConfig},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const FARM: &str = "LKBONNY1";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

fn wind_at(offset: i64) -> f64 {
    4.0 + offset.rem_euclid(9) as f64
}

/// Output is a fixed multiple of wind speed so a linear model recovers it.
fn power_at(offset: i64) -> f64 {
    3.0 * wind_at(offset)
}

/// Mock sources over the default window, optionally dropping the temperature
/// reading of one forecast hour.
async fn start_sources(missing_temperature: Option<i64>) -> (MockServer, MockServer) {
    let weather = MockServer::start().await;
    let power = MockServer::start().await;

    let hourly: Vec<Value> = (-24..=48)
        .map(|h| {
            json!({
                "time": (now() + Duration::hours(h)).to_rfc3339(),
                "temperature": (Some(h) != missing_temperature)
                    .then(|| 12.0 + h.rem_euclid(5) as f64),
                "wind_speed": wind_at(h),
                "wind_gust": wind_at(h) + 3.0,
                "icon": if h < 0 { "cloudy" } else { "wind" }
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/hourly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "hourly": hourly })))
        .mount(&weather)
        .await;

    let data: Vec<Value> = (-24..=0)
        .map(|h| {
            json!({
                "time": (now() + Duration::hours(h)).to_rfc3339(),
                "power": power_at(h)
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/hourly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": data })))
        .mount(&power)
        .await;

    (weather, power)
}

fn context(
    weather: &MockServer,
    power: &MockServer,
    model_dir: &tempfile::TempDir,
) -> UpdateContext<MemoryStore, MockClock> {
    let network = NetworkConfig::default();
    UpdateContext {
        store: MemoryStore::new(),
        weather: WeatherClient::new(weather.uri(), &network).unwrap(),
        power: PowerClient::new(power.uri(), &network).unwrap(),
        farms: vec![Farm::new(FARM, "Lake Bonney Wind Farm", -37.76, 140.40)],
        model_path: model_dir.path().join("models.json"),
        min_samples: 20,
        update: UpdateConfig::default(),
        clock: MockClock::new(now() + Duration::minutes(7)),
    }
}

// ==================== Full Cycle ====================

#[tokio::test]
async fn test_full_update_cycle() {
    let (weather, power) = start_sources(None).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&weather, &power, &dir);

    // First run has no model yet: weather and power only
    let report = run_action(&ctx, Action::from_event("updateData")).await.unwrap();
    assert_eq!(report.farms_updated, 1);
    assert_eq!(ctx.store.len(FARM), 73);
    assert!(ctx.store.fetch(FARM, None).await.unwrap().iter().all(|r| r.prediction.is_none()));

    let report = run_action(&ctx, Action::from_event("retrain")).await.unwrap();
    assert_eq!(report.samples.get(FARM), Some(&25));

    let report = run_action(&ctx, Action::from_event("updatePred")).await.unwrap();
    assert_eq!(report.points_written, 73);

    let points = into_ascending(ctx.store.fetch(FARM, Some(96)).await.unwrap()).unwrap();
    let split = split_series(&points).unwrap();

    assert_eq!(split.boundary_index, 25);
    assert_eq!(split.observed_len(), 25);
    assert_eq!(split.forecast_len(), 48);
    assert!(!split.has_gaps);
    assert_eq!(split.transition.timestamp, now());

    for (i, point) in points.iter().enumerate() {
        let offset = i as i64 - 24;
        assert!(
            (point.prediction - power_at(offset)).abs() < 1e-6,
            "prediction at {offset} was {}",
            point.prediction
        );
    }

    let chart = forecast_chart(&points).unwrap();
    assert_eq!(chart.forecast.points.first().map(|(t, _)| *t), Some(now()));

    let conditions = current_conditions(&points).unwrap();
    assert_eq!(conditions.timestamp, now());
    assert_eq!(conditions.icon, "wind");
}

/// Re-running the data update overwrites in place rather than duplicating.
#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let (weather, power) = start_sources(None).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&weather, &power, &dir);

    run_action(&ctx, Action::UpdateData).await.unwrap();
    run_action(&ctx, Action::Retrain).await.unwrap();
    run_action(&ctx, Action::UpdateData).await.unwrap();

    assert_eq!(ctx.store.len(FARM), 73);
    let observed = ctx.store.fetch_observed(FARM).await.unwrap();
    assert_eq!(observed.len(), 25);
    assert!(observed.iter().all(|r| r.prediction.is_some()));

    let latest = ctx.store.latest_observed(FARM).await.unwrap().unwrap();
    assert_eq!(latest.timestamp, now());
    assert_eq!(latest.actual, Some(power_at(0)));
}

/// An hour with a missing reading still ends up readable by the splitter.
#[tokio::test]
async fn test_cycle_with_missing_temperature() {
    let (weather, power) = start_sources(Some(10)).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&weather, &power, &dir);

    for action in ["updateData", "retrain", "updatePred", "updateData"] {
        let report = run_action(&ctx, Action::from_event(action)).await.unwrap();
        assert!(report.farms_failed.is_empty(), "{action} failed");
    }

    let records = ctx.store.fetch(FARM, None).await.unwrap();
    assert_eq!(records.len(), 73);
    assert!(records.iter().all(|r| r.prediction.is_some()));

    let points = into_ascending(records).unwrap();
    let split = split_series(&points).unwrap();
    assert_eq!(split.forecast_len(), 48);

    let gap = &points[34];
    assert_eq!(gap.timestamp, now() + Duration::hours(10));
    assert_eq!(gap.temperature, None);
    assert!((gap.prediction - power_at(10)).abs() < 1e-6);
}
