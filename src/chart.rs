//! Dashboard view models.
//!
//! Builds renderer-agnostic line series from a farm's hourly records. History
//! is drawn solid and forecast dashed; both segments share the transition
//! point so the lines meet.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::api::FarmReading;
use crate::config::Farm;
use crate::series::{SeriesError, SeriesSplit, TimePoint, round2, split_series};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Solid,
    Dashed,
}

/// One line of a chart. `None` values are drawn as gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartLine {
    pub name: String,
    /// Lines in the same group are toggled together from the legend.
    pub legend_group: String,
    pub style: LineStyle,
    pub show_legend: bool,
    pub points: Vec<(DateTime<Utc>, Option<f64>)>,
}

impl ChartLine {
    fn new(name: &str, legend_group: &str, style: LineStyle) -> Self {
        Self {
            name: name.to_string(),
            legend_group: legend_group.to_string(),
            style,
            // Dashed segments share the legend entry of their solid line
            show_legend: style == LineStyle::Solid,
            points: Vec::new(),
        }
    }

    fn with_points<F>(mut self, points: &[TimePoint], value: F) -> Self
    where
        F: Fn(&TimePoint) -> Option<f64>,
    {
        self.points = points.iter().map(|p| (p.timestamp, value(p))).collect();
        self
    }

    fn with_values(mut self, values: Vec<(DateTime<Utc>, f64)>) -> Self {
        self.points = values.into_iter().map(|(t, v)| (t, Some(round2(v)))).collect();
        self
    }

    /// Values present on this line.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().filter_map(|(_, v)| *v)
    }
}

/// Observed range including the transition point, and forecast range starting
/// at it.
fn segments<'a>(
    points: &'a [TimePoint],
    split: &SeriesSplit,
) -> (&'a [TimePoint], &'a [TimePoint]) {
    let joint = points.partition_point(|p| p.timestamp < split.transition.timestamp);
    (&points[..split.boundary_index], &points[joint..])
}

/// Predicted vs. actual output for one farm.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastChart {
    pub boundary_index: usize,
    /// Dashed prediction from the transition point on.
    pub forecast: ChartLine,
    /// Measured output over the whole range.
    pub actual: ChartLine,
    /// Solid prediction over the observed range.
    pub prediction: ChartLine,
}

impl ForecastChart {
    pub const Y_SUFFIX: &'static str = " MW";

    /// Lines in drawing order; dashed first so solid lines sit on top.
    pub fn lines(&self) -> [&ChartLine; 3] {
        [&self.forecast, &self.actual, &self.prediction]
    }
}

/// Build the forecast chart for an ascending series.
pub fn forecast_chart(points: &[TimePoint]) -> Result<ForecastChart, SeriesError> {
    let split = split_series(points)?;
    let (history, _) = segments(points, &split);

    Ok(ForecastChart {
        boundary_index: split.boundary_index,
        forecast: ChartLine::new("Prediction (Forecast)", "Forecast", LineStyle::Dashed)
            .with_values(split.forecast_with_transition()),
        actual: ChartLine::new("Actual", "Actual", LineStyle::Solid)
            .with_points(points, |p| p.actual.map(round2)),
        prediction: ChartLine::new("Prediction", "Forecast", LineStyle::Solid)
            .with_points(history, |p| Some(round2(p.prediction))),
    })
}

/// Wind and temperature for one farm, split like the forecast chart.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherChart {
    pub boundary_index: usize,
    /// Wind speed and gust lines, in m/s.
    pub wind_panel: Vec<ChartLine>,
    /// Temperature lines, in °C.
    pub temperature_panel: Vec<ChartLine>,
}

impl WeatherChart {
    pub const WIND_SUFFIX: &'static str = " m/s";
    pub const TEMPERATURE_SUFFIX: &'static str = " °C";
}

fn weather_lines<F>(
    name: &str,
    history: &[TimePoint],
    ahead: &[TimePoint],
    value: F,
) -> [ChartLine; 2]
where
    F: Fn(&TimePoint) -> Option<f64> + Copy,
{
    [
        ChartLine::new(&format!("{name} (Forecast)"), name, LineStyle::Dashed)
            .with_points(ahead, value),
        ChartLine::new(name, name, LineStyle::Solid).with_points(history, value),
    ]
}

pub fn weather_chart(points: &[TimePoint]) -> Result<WeatherChart, SeriesError> {
    let split = split_series(points)?;
    let (history, ahead) = segments(points, &split);

    let mut wind_panel = Vec::with_capacity(4);
    wind_panel.extend(weather_lines("Wind", history, ahead, |p| p.wind_speed));
    wind_panel.extend(weather_lines("Gust", history, ahead, |p| p.wind_gust));

    Ok(WeatherChart {
        boundary_index: split.boundary_index,
        wind_panel,
        temperature_panel: weather_lines("Temp", history, ahead, |p| p.temperature).into(),
    })
}

/// Latest observed weather at a farm.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentConditions {
    pub timestamp: DateTime<Utc>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub temperature: Option<f64>,
    pub icon: String,
}

impl CurrentConditions {
    pub fn describe(&self) -> String {
        let show = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| v.to_string());
        format!(
            "Wind: {} (m/s), gust: {} (m/s), temperature: {} °C.",
            show(self.wind_speed),
            show(self.wind_gust),
            show(self.temperature)
        )
    }
}

/// Conditions at the most recent hour with a measured output.
pub fn current_conditions(points: &[TimePoint]) -> Option<CurrentConditions> {
    let latest = points.iter().rev().find(|p| p.is_observed())?;

    Some(CurrentConditions {
        timestamp: latest.timestamp,
        wind_speed: latest.wind_speed,
        wind_gust: latest.wind_gust,
        temperature: latest.temperature,
        icon: latest.icon.clone().unwrap_or_else(|| "default".to_string()),
    })
}

/// How far back the dashboard looks.
///
/// Every range adds two days so the forecast window is always on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryRange {
    #[default]
    PastTwoDays,
    PastWeek,
    PastMonth,
    PastThreeMonths,
    PastSixMonths,
    PastYear,
    AllTime,
}

impl HistoryRange {
    pub const ALL: [HistoryRange; 7] = [
        HistoryRange::PastTwoDays,
        HistoryRange::PastWeek,
        HistoryRange::PastMonth,
        HistoryRange::PastThreeMonths,
        HistoryRange::PastSixMonths,
        HistoryRange::PastYear,
        HistoryRange::AllTime,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            HistoryRange::PastTwoDays => "Past 2 Days",
            HistoryRange::PastWeek => "Past Week",
            HistoryRange::PastMonth => "Past Month",
            HistoryRange::PastThreeMonths => "Past 3 Months",
            HistoryRange::PastSixMonths => "Past 6 Months",
            HistoryRange::PastYear => "Past Year",
            HistoryRange::AllTime => "All time",
        }
    }

    fn days(&self) -> Option<usize> {
        match self {
            HistoryRange::PastTwoDays => Some(2),
            HistoryRange::PastWeek => Some(7),
            HistoryRange::PastMonth => Some(30),
            HistoryRange::PastThreeMonths => Some(90),
            HistoryRange::PastSixMonths => Some(180),
            HistoryRange::PastYear => Some(365),
            HistoryRange::AllTime => None,
        }
    }

    /// Number of hourly records to fetch; `None` means everything.
    pub fn hours(&self) -> Option<usize> {
        self.days().map(|days| (2 + days) * 24)
    }

    fn key(&self) -> &'static str {
        match self {
            HistoryRange::PastTwoDays => "2d",
            HistoryRange::PastWeek => "week",
            HistoryRange::PastMonth => "month",
            HistoryRange::PastThreeMonths => "3months",
            HistoryRange::PastSixMonths => "6months",
            HistoryRange::PastYear => "year",
            HistoryRange::AllTime => "all",
        }
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for HistoryRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        HistoryRange::ALL
            .into_iter()
            .find(|range| range.key() == s)
            .ok_or_else(|| {
                let keys: Vec<&str> = HistoryRange::ALL.iter().map(|r| r.key()).collect();
                format!("unknown range '{s}', expected one of: {}", keys.join(", "))
            })
    }
}

/// `"wind_speed"` -> `"Wind Speed"`.
pub fn format_title(s: &str) -> String {
    s.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn plot_title(farm_name: &str) -> String {
    format!("Hourly wind power forecast at {farm_name}")
}

/// A farm's current output for the map view.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmOutput {
    pub farm: Farm,
    pub station_name: String,
    pub output_mw: f64,
}

/// Current output of the configured farms.
///
/// Negative and missing readings show as zero; output is rounded to 0.1 MW.
pub fn farm_outputs(readings: &[FarmReading], farms: &[Farm]) -> Vec<FarmOutput> {
    farms
        .iter()
        .filter_map(|farm| {
            let reading = readings.iter().find(|r| r.duid == farm.id)?;
            let output = reading.output_mw.filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0);

            Some(FarmOutput {
                farm: farm.clone(),
                station_name: short_station_name(&reading.station_name),
                output_mw: (output * 10.0).round() / 10.0,
            })
        })
        .collect()
}

fn short_station_name(name: &str) -> String {
    name.replace("Wind Farm", "").replace("Windfarm", "").trim().to_string()
}
