//! Feature extraction for the power models.
//!
//! Turns the weather attributes of an hourly record into the input row of a
//! farm's regression model.

use std::f64::consts::PI;

use chrono::{DateTime, Timelike, Utc};

use crate::api::WeatherObservation;
use crate::series::PointRecord;

/// Model input for one hour.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub wind_speed: f64,
    pub wind_gust: f64,
    pub temperature: f64,
    // Cyclical hour of day (prevents the 23 -> 0 discontinuity)
    pub hour_sin: f64,
    pub hour_cos: f64,
}

impl FeatureRow {
    /// Number of model inputs produced by [`FeatureRow::to_vec`].
    pub const NUM_FEATURES: usize = 7;

    /// Build a row from raw weather values.
    ///
    /// Returns `None` without wind speed or temperature. A missing gust falls
    /// back to the wind speed.
    pub fn from_weather(
        timestamp: DateTime<Utc>,
        wind_speed: Option<f64>,
        wind_gust: Option<f64>,
        temperature: Option<f64>,
    ) -> Option<Self> {
        let wind_speed = wind_speed.filter(|v| v.is_finite())?;
        let temperature = temperature.filter(|v| v.is_finite())?;
        let wind_gust = wind_gust.filter(|v| v.is_finite()).unwrap_or(wind_speed);
        let (hour_sin, hour_cos) = cyclical_encode(timestamp.hour() as f64, 24.0);

        Some(Self {
            wind_speed,
            wind_gust,
            temperature,
            hour_sin,
            hour_cos,
        })
    }

    pub fn from_record(record: &PointRecord) -> Option<Self> {
        Self::from_weather(
            record.timestamp,
            record.wind_speed,
            record.wind_gust,
            record.temperature,
        )
    }

    /// Flatten into model input order.
    ///
    /// Turbine output follows the cube of wind speed below rated speed, so the
    /// square and cube are included as separate inputs.
    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.wind_speed,
            self.wind_speed.powi(2),
            self.wind_speed.powi(3),
            self.wind_gust,
            self.temperature,
            self.hour_sin,
            self.hour_cos,
        ]
    }

    /// Feature names for logging, matching [`FeatureRow::to_vec`].
    pub fn feature_names() -> [&'static str; Self::NUM_FEATURES] {
        [
            "wind_speed",
            "wind_speed_sq",
            "wind_speed_cu",
            "wind_gust",
            "temperature",
            "hour_sin",
            "hour_cos",
        ]
    }
}

/// Weather inputs for one hour, as fetched or as stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherHour {
    pub timestamp: DateTime<Utc>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub temperature: Option<f64>,
}

impl From<&PointRecord> for WeatherHour {
    fn from(record: &PointRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            wind_speed: record.wind_speed,
            wind_gust: record.wind_gust,
            temperature: record.temperature,
        }
    }
}

impl From<&WeatherObservation> for WeatherHour {
    fn from(observation: &WeatherObservation) -> Self {
        Self {
            timestamp: observation.time,
            wind_speed: observation.wind_speed,
            wind_gust: observation.wind_gust,
            temperature: observation.temperature,
        }
    }
}

/// Feature rows for an ascending run of hours, filling missing wind speed and
/// temperature from the neighbouring hours.
///
/// An hour is `None` only when its column has no known value anywhere in the
/// run.
pub fn impute_features(hours: &[WeatherHour]) -> Vec<Option<FeatureRow>> {
    let column = |value: fn(&WeatherHour) -> Option<f64>| -> Vec<Option<f64>> {
        let series: Vec<(DateTime<Utc>, Option<f64>)> =
            hours.iter().map(|h| (h.timestamp, value(h))).collect();
        fill_gaps(&series)
    };
    let speeds = column(|h| h.wind_speed);
    let temperatures = column(|h| h.temperature);

    hours
        .iter()
        .zip(speeds)
        .zip(temperatures)
        .map(|((hour, speed), temperature)| {
            FeatureRow::from_weather(hour.timestamp, speed, hour.wind_gust, temperature)
        })
        .collect()
}

/// Interpolate interior gaps linearly in time; edges take the nearest known
/// value.
fn fill_gaps(series: &[(DateTime<Utc>, Option<f64>)]) -> Vec<Option<f64>> {
    let known: Vec<(usize, f64)> = series
        .iter()
        .enumerate()
        .filter_map(|(i, (_, v))| v.filter(|v| v.is_finite()).map(|v| (i, v)))
        .collect();

    let mut next = 0;
    series
        .iter()
        .enumerate()
        .map(|(i, (time, _))| {
            while next < known.len() && known[next].0 < i {
                next += 1;
            }
            let before = next.checked_sub(1).map(|k| known[k]);
            let after = known.get(next).copied();

            match (before, after) {
                (_, Some((j, value))) if j == i => Some(value),
                (Some((b, from)), Some((a, to))) => {
                    let span = (series[a].0 - series[b].0).num_seconds() as f64;
                    let elapsed = (*time - series[b].0).num_seconds() as f64;
                    let fraction = if span > 0.0 { elapsed / span } else { 0.0 };
                    Some(from + (to - from) * fraction)
                }
                (Some((_, value)), None) | (None, Some((_, value))) => Some(value),
                (None, None) => None,
            }
        })
        .collect()
}

/// Rows with complete weather and a measured output, with their targets.
pub fn training_set(records: &[PointRecord]) -> (Vec<FeatureRow>, Vec<f64>) {
    records
        .iter()
        .filter_map(|record| {
            let actual = record.actual.filter(|v| v.is_finite())?;
            FeatureRow::from_record(record).map(|row| (row, actual))
        })
        .unzip()
}

/// Cyclical encoding for periodic features.
/// Returns (sin, cos) encoding to preserve continuity.
fn cyclical_encode(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}
