//! Wind Forecast Library
//!
//! Hourly wind-power forecasting for a set of wind farms: the updater that
//! keeps each farm's series current, the models behind its predictions, and
//! the splitter that separates observed history from forecast for display.

pub mod api;
pub mod chart;
pub mod config;
pub mod db;
pub mod features;
pub mod model;
pub mod series;
pub mod store;
pub mod traits;
pub mod updater;

// Re-export commonly used types
pub use api::{FarmReading, PowerClient, PowerObservation, WeatherClient, WeatherObservation};
pub use chart::{
    ChartLine, CurrentConditions, FarmOutput, ForecastChart, HistoryRange, LineStyle,
    WeatherChart, current_conditions, farm_outputs, forecast_chart, format_title, plot_title,
    weather_chart,
};
pub use config::{AppConfig, Farm};
pub use db::Database;
pub use features::FeatureRow;
pub use model::{ModelError, ModelSet, PowerModel};
pub use series::{
    PointRecord, SeriesError, SeriesSplit, TimePoint, into_ascending, round2, split_series,
};
pub use store::{MemoryStore, PointUpdate, SeriesStore};
pub use traits::{Clock, HourWindow, MockClock, SystemClock};
pub use updater::{Action, RunReport, UpdateContext, run_action};
