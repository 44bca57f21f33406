//! Hourly time series for a single farm and the observed/forecast split.
//!
//! The updater writes one record per farm per hour. Hours that already have a
//! measured output carry `actual`; hours still inside the forecast window only
//! carry the model `prediction`. Sorted ascending, the observed hours form a
//! prefix, and [`split_series`] finds where that prefix ends. Every consumer
//! (charts, summaries, exports) goes through this one function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while preparing or splitting a series.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Malformed record at {timestamp}: prediction is missing or not finite")]
    MalformedRecord { timestamp: DateTime<Utc> },
}

/// One hourly record for a farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    /// Model output in MW, clamped at zero by the updater.
    pub prediction: f64,
    /// Measured output in MW, absent while the hour is forecast-only.
    pub actual: Option<f64>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub icon: Option<String>,
}

impl TimePoint {
    /// A forecast-only hour without weather attributes.
    pub fn forecast(timestamp: DateTime<Utc>, prediction: f64) -> Self {
        Self {
            timestamp,
            prediction,
            actual: None,
            temperature: None,
            wind_speed: None,
            wind_gust: None,
            icon: None,
        }
    }

    /// An observed hour without weather attributes.
    pub fn observed(timestamp: DateTime<Utc>, prediction: f64, actual: f64) -> Self {
        Self {
            actual: Some(actual),
            ..Self::forecast(timestamp, prediction)
        }
    }

    pub fn is_observed(&self) -> bool {
        self.actual.is_some()
    }
}

/// A record as stored, before validation.
///
/// An hour can receive its observation before any forecast was written for it,
/// so `prediction` is optional here and required on [`TimePoint`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub timestamp: DateTime<Utc>,
    pub prediction: Option<f64>,
    pub actual: Option<f64>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub icon: Option<String>,
}

impl PointRecord {
    /// Validate the record, failing when the prediction is missing.
    pub fn into_time_point(self) -> Result<TimePoint, SeriesError> {
        let Some(prediction) = self.prediction else {
            return Err(SeriesError::MalformedRecord {
                timestamp: self.timestamp,
            });
        };

        Ok(TimePoint {
            timestamp: self.timestamp,
            prediction,
            actual: self.actual,
            temperature: self.temperature,
            wind_speed: self.wind_speed,
            wind_gust: self.wind_gust,
            icon: self.icon,
        })
    }
}

impl From<TimePoint> for PointRecord {
    fn from(point: TimePoint) -> Self {
        Self {
            timestamp: point.timestamp,
            prediction: Some(point.prediction),
            actual: point.actual,
            temperature: point.temperature,
            wind_speed: point.wind_speed,
            wind_gust: point.wind_gust,
            icon: point.icon,
        }
    }
}

/// Sort store records ascending and validate them.
///
/// Stores are free to return rows newest-first; the splitter needs oldest-first.
pub fn into_ascending(mut records: Vec<PointRecord>) -> Result<Vec<TimePoint>, SeriesError> {
    records.sort_by_key(|r| r.timestamp);
    records.into_iter().map(PointRecord::into_time_point).collect()
}

/// Result of splitting a series at the observed/forecast boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSplit {
    /// Index of the first forecast-only point; equals the series length when
    /// every point is observed.
    pub boundary_index: usize,
    /// `(timestamp, actual)` for observed points before the boundary.
    pub observed: Vec<(DateTime<Utc>, f64)>,
    /// `(timestamp, prediction)` for points from the boundary to the end.
    pub forecast: Vec<(DateTime<Utc>, f64)>,
    /// Last observed point, or the first point when nothing is observed.
    /// Shared by both views so their lines meet.
    pub transition: TimePoint,
    /// Set when an hour before the boundary has no `actual`.
    pub has_gaps: bool,
}

impl SeriesSplit {
    pub fn observed_len(&self) -> usize {
        self.observed.len()
    }

    pub fn forecast_len(&self) -> usize {
        self.forecast.len()
    }

    pub fn is_all_observed(&self) -> bool {
        self.forecast.is_empty()
    }

    pub fn is_all_forecast(&self) -> bool {
        self.boundary_index == 0
    }

    /// The value to trust at `index`: `actual` before the boundary, `prediction`
    /// from the boundary on.
    ///
    /// Returns `None` past the end, and for gaps before the boundary.
    pub fn trusted_value(&self, points: &[TimePoint], index: usize) -> Option<f64> {
        let point = points.get(index)?;
        if index < self.boundary_index {
            point.actual
        } else {
            Some(point.prediction)
        }
    }

    /// The forecast view prefixed by the transition point's prediction, unless
    /// the transition point already opens the forecast.
    pub fn forecast_with_transition(&self) -> Vec<(DateTime<Utc>, f64)> {
        let joint = (self.transition.timestamp, self.transition.prediction);
        if self.forecast.first().map(|(t, _)| *t) == Some(joint.0) {
            return self.forecast.clone();
        }

        std::iter::once(joint)
            .chain(self.forecast.iter().copied())
            .collect()
    }

    pub fn rounded_observed(&self) -> Vec<(DateTime<Utc>, f64)> {
        self.observed.iter().map(|&(t, v)| (t, round2(v))).collect()
    }

    pub fn rounded_forecast(&self) -> Vec<(DateTime<Utc>, f64)> {
        self.forecast.iter().map(|&(t, v)| (t, round2(v))).collect()
    }
}

/// Round to two decimal places for display.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Split an ascending series into observed history and forecast.
///
/// The boundary is the index after the last point with `actual` present, or 0
/// when no point is observed. An hour missing its `actual` before that point
/// does not move the boundary; it is skipped in `observed` and flagged through
/// [`SeriesSplit::has_gaps`].
pub fn split_series(points: &[TimePoint]) -> Result<SeriesSplit, SeriesError> {
    if points.is_empty() {
        return Err(SeriesError::InvalidInput(
            "series must contain at least one point".to_string(),
        ));
    }

    if let Some(pair) = points
        .windows(2)
        .find(|pair| pair[1].timestamp <= pair[0].timestamp)
    {
        return Err(SeriesError::InvalidInput(format!(
            "timestamps must be strictly ascending: {} follows {}",
            pair[1].timestamp, pair[0].timestamp
        )));
    }

    if let Some(bad) = points.iter().find(|p| !p.prediction.is_finite()) {
        return Err(SeriesError::MalformedRecord {
            timestamp: bad.timestamp,
        });
    }

    let boundary_index = points
        .iter()
        .rposition(TimePoint::is_observed)
        .map_or(0, |i| i + 1);

    let observed: Vec<(DateTime<Utc>, f64)> = points[..boundary_index]
        .iter()
        .filter_map(|p| p.actual.map(|actual| (p.timestamp, actual)))
        .collect();
    let has_gaps = observed.len() < boundary_index;

    let forecast = points[boundary_index..]
        .iter()
        .map(|p| (p.timestamp, p.prediction))
        .collect();

    let transition = points[boundary_index.saturating_sub(1)].clone();

    Ok(SeriesSplit {
        boundary_index,
        observed,
        forecast,
        transition,
        has_gaps,
    })
}
