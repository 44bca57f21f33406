use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::{Farm, NetworkConfig};
use crate::traits::truncate_to_hour;

const PARAM_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One hour of weather at a farm, observed or forecast.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeatherObservation {
    pub time: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    hourly: Vec<WeatherObservation>,
}

/// Hourly mean output of a farm in MW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerObservation {
    pub time: DateTime<Utc>,
    pub power: f64,
}

#[derive(Debug, Deserialize)]
struct PowerReading {
    time: DateTime<Utc>,
    power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PowerResponse {
    data: Vec<PowerReading>,
}

/// Current output of one generating unit, as reported by the market feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FarmReading {
    pub duid: String,
    pub station_name: String,
    pub output_mw: Option<f64>,
}

fn build_client(network_config: &NetworkConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(network_config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
        .build()
        .context("Failed to create HTTP client")
}

fn endpoint(base_url: &str, path: &str, params: &[(&str, String)]) -> Result<Url> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
    Url::parse_with_params(&url, params).with_context(|| format!("Invalid URL: {url}"))
}

async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: Url,
    source: &str,
) -> Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to send request to {source} API"))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("{source} API returned error status: {status}");
    }

    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to parse {source} API response"))
}

/// Client for the hourly weather source.
#[derive(Clone, Debug)]
pub struct WeatherClient {
    client: reqwest::Client,
    base_url: String,
}

impl WeatherClient {
    pub fn new(base_url: String, network_config: &NetworkConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(network_config)?,
            base_url,
        })
    }

    /// Hourly weather at `farm` between `start` and `end`, one entry per hour.
    pub async fn fetch_hourly(
        &self,
        farm: &Farm,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>> {
        let url = endpoint(
            &self.base_url,
            "hourly",
            &[
                ("latitude", farm.latitude.to_string()),
                ("longitude", farm.longitude.to_string()),
                ("start", start.format(PARAM_TIME_FORMAT).to_string()),
                ("end", end.format(PARAM_TIME_FORMAT).to_string()),
            ],
        )?;

        let response: WeatherResponse = get_json(&self.client, url, "weather").await?;
        Ok(align_weather(response.hourly))
    }
}

/// Truncate to the hour, keeping the first entry for each hour.
fn align_weather(observations: Vec<WeatherObservation>) -> Vec<WeatherObservation> {
    let mut by_hour: BTreeMap<DateTime<Utc>, WeatherObservation> = BTreeMap::new();
    for mut observation in observations {
        observation.time = truncate_to_hour(observation.time);
        by_hour.entry(observation.time).or_insert(observation);
    }
    by_hour.into_values().collect()
}

/// Client for the generation data source.
#[derive(Clone, Debug)]
pub struct PowerClient {
    client: reqwest::Client,
    base_url: String,
}

impl PowerClient {
    pub fn new(base_url: String, network_config: &NetworkConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(network_config)?,
            base_url,
        })
    }

    /// Hourly mean output of `farm` between `start` and `end`.
    ///
    /// Sub-hourly readings are averaged into their hour; readings without a
    /// value are dropped.
    pub async fn fetch_hourly(
        &self,
        farm: &Farm,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PowerObservation>> {
        let url = endpoint(
            &self.base_url,
            "hourly",
            &[
                ("duid", farm.id.clone()),
                ("start", start.format(PARAM_TIME_FORMAT).to_string()),
                ("end", end.format(PARAM_TIME_FORMAT).to_string()),
            ],
        )?;

        let response: PowerResponse = get_json(&self.client, url, "power").await?;
        Ok(hourly_means(response.data))
    }

    /// Latest output of every unit in the feed.
    pub async fn fetch_current(&self) -> Result<Vec<FarmReading>> {
        let url = endpoint(&self.base_url, "current", &[])?;
        get_json(&self.client, url, "power").await
    }
}

fn hourly_means(readings: Vec<PowerReading>) -> Vec<PowerObservation> {
    let mut by_hour: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
    for reading in readings {
        let Some(power) = reading.power.filter(|p| p.is_finite()) else {
            continue;
        };
        let entry = by_hour
            .entry(truncate_to_hour(reading.time))
            .or_insert((0.0, 0));
        entry.0 += power;
        entry.1 += 1;
    }

    by_hour
        .into_iter()
        .map(|(time, (sum, count))| PowerObservation {
            time,
            power: sum / count as f64,
        })
        .collect()
}
