//! Query and upsert contract between the updater and its consumers.
//!
//! Records are keyed by `(farm, timestamp)`. An upsert only writes the fields
//! it carries, so a weather/prediction update and a later power update for the
//! same hour merge into one record.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::series::PointRecord;

/// Partial record written by the updater.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointUpdate {
    pub timestamp: DateTime<Utc>,
    pub prediction: Option<f64>,
    pub actual: Option<f64>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub icon: Option<String>,
}

impl PointUpdate {
    /// Only the model output for an hour.
    pub fn prediction(timestamp: DateTime<Utc>, prediction: f64) -> Self {
        Self {
            timestamp,
            prediction: Some(prediction),
            ..Default::default()
        }
    }

    /// Only the measured output for an hour.
    pub fn observation(timestamp: DateTime<Utc>, actual: f64) -> Self {
        Self {
            timestamp,
            actual: Some(actual),
            ..Default::default()
        }
    }

    /// Weather attributes for an hour.
    pub fn weather(
        timestamp: DateTime<Utc>,
        temperature: Option<f64>,
        wind_speed: Option<f64>,
        wind_gust: Option<f64>,
        icon: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            temperature,
            wind_speed,
            wind_gust,
            icon,
            ..Default::default()
        }
    }

    pub fn with_prediction(mut self, prediction: f64) -> Self {
        self.prediction = Some(prediction);
        self
    }

    /// Write the fields this update carries into `record`, keeping the rest.
    pub fn apply(&self, record: &mut PointRecord) {
        record.timestamp = self.timestamp;
        if self.prediction.is_some() {
            record.prediction = self.prediction;
        }
        if self.actual.is_some() {
            record.actual = self.actual;
        }
        if self.temperature.is_some() {
            record.temperature = self.temperature;
        }
        if self.wind_speed.is_some() {
            record.wind_speed = self.wind_speed;
        }
        if self.wind_gust.is_some() {
            record.wind_gust = self.wind_gust;
        }
        if self.icon.is_some() {
            record.icon.clone_from(&self.icon);
        }
    }
}

/// Storage for per-farm hourly records.
pub trait SeriesStore: Send + Sync {
    /// The most recent `limit` hours (all when `None`), oldest first.
    fn fetch(
        &self,
        farm: &str,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<PointRecord>>> + Send;

    /// Every hour with a measured output, oldest first.
    fn fetch_observed(&self, farm: &str) -> impl Future<Output = Result<Vec<PointRecord>>> + Send;

    /// The newest hour with a measured output.
    fn latest_observed(
        &self,
        farm: &str,
    ) -> impl Future<Output = Result<Option<PointRecord>>> + Send;

    /// Upsert by `(farm, timestamp)`. Returns the number of updates written.
    fn upsert(
        &self,
        farm: &str,
        updates: &[PointUpdate],
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    farms: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, PointRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for a farm.
    pub fn len(&self, farm: &str) -> usize {
        self.farms
            .lock()
            .unwrap()
            .get(farm)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, farm: &str) -> bool {
        self.len(farm) == 0
    }

    /// A single record, for assertions.
    pub fn get(&self, farm: &str, timestamp: DateTime<Utc>) -> Option<PointRecord> {
        self.farms
            .lock()
            .unwrap()
            .get(farm)
            .and_then(|series| series.get(&timestamp).cloned())
    }
}

impl SeriesStore for MemoryStore {
    async fn fetch(&self, farm: &str, limit: Option<usize>) -> Result<Vec<PointRecord>> {
        let farms = self.farms.lock().unwrap();
        let Some(series) = farms.get(farm) else {
            return Ok(Vec::new());
        };

        let skip = limit.map_or(0, |limit| series.len().saturating_sub(limit));
        Ok(series.values().skip(skip).cloned().collect())
    }

    async fn fetch_observed(&self, farm: &str) -> Result<Vec<PointRecord>> {
        let farms = self.farms.lock().unwrap();
        Ok(farms
            .get(farm)
            .map(|series| {
                series
                    .values()
                    .filter(|r| r.actual.is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_observed(&self, farm: &str) -> Result<Option<PointRecord>> {
        let farms = self.farms.lock().unwrap();
        Ok(farms.get(farm).and_then(|series| {
            series
                .values()
                .rev()
                .find(|r| r.actual.is_some())
                .cloned()
        }))
    }

    async fn upsert(&self, farm: &str, updates: &[PointUpdate]) -> Result<usize> {
        let mut farms = self.farms.lock().unwrap();
        let series = farms.entry(farm.to_string()).or_default();

        for update in updates {
            let record = series.entry(update.timestamp).or_default();
            update.apply(record);
        }

        Ok(updates.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    #[tokio::test]
    async fn test_upsert_merges_fields() {
        let store = MemoryStore::new();

        store
            .upsert("SNOWTWN1", &[PointUpdate::prediction(hour(1), 12.5)])
            .await
            .unwrap();
        store
            .upsert("SNOWTWN1", &[PointUpdate::observation(hour(1), 11.0)])
            .await
            .unwrap();

        let record = store.get("SNOWTWN1", hour(1)).unwrap();
        assert_eq!(record.prediction, Some(12.5));
        assert_eq!(record.actual, Some(11.0));
        assert_eq!(store.len("SNOWTWN1"), 1);
    }

    #[tokio::test]
    async fn test_upsert_last_write_wins() {
        let store = MemoryStore::new();

        store
            .upsert("BLUFF1", &[PointUpdate::prediction(hour(1), 1.0)])
            .await
            .unwrap();
        store
            .upsert("BLUFF1", &[PointUpdate::prediction(hour(1), 2.0)])
            .await
            .unwrap();

        assert_eq!(store.get("BLUFF1", hour(1)).unwrap().prediction, Some(2.0));
    }

    #[tokio::test]
    async fn test_fetch_returns_most_recent_ascending() {
        let store = MemoryStore::new();
        let updates: Vec<_> = (0..10)
            .rev()
            .map(|h| PointUpdate::prediction(hour(h), h as f64))
            .collect();
        store.upsert("BLUFF1", &updates).await.unwrap();

        let records = store.fetch("BLUFF1", Some(3)).await.unwrap();
        let hours: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(hours, vec![hour(7), hour(8), hour(9)]);

        let all = store.fetch("BLUFF1", None).await.unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_fetch_unknown_farm_is_empty() {
        let store = MemoryStore::new();
        assert!(store.fetch("NOPE", None).await.unwrap().is_empty());
        assert!(store.latest_observed("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_observed_queries() {
        let store = MemoryStore::new();
        store
            .upsert(
                "HDWF1",
                &[
                    PointUpdate::prediction(hour(1), 1.0),
                    PointUpdate::observation(hour(1), 1.5),
                    PointUpdate::observation(hour(2), 2.5),
                    PointUpdate::prediction(hour(3), 3.0),
                ],
            )
            .await
            .unwrap();

        let observed = store.fetch_observed("HDWF1").await.unwrap();
        assert_eq!(observed.len(), 2);

        let latest = store.latest_observed("HDWF1").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, hour(2));
        assert_eq!(latest.actual, Some(2.5));
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut record = PointRecord {
            timestamp: hour(1),
            prediction: Some(4.0),
            temperature: Some(18.0),
            icon: Some("wind".to_string()),
            ..Default::default()
        };

        PointUpdate::observation(hour(1), 3.5).apply(&mut record);

        assert_eq!(record.prediction, Some(4.0));
        assert_eq!(record.temperature, Some(18.0));
        assert_eq!(record.icon.as_deref(), Some("wind"));
        assert_eq!(record.actual, Some(3.5));
    }
}
