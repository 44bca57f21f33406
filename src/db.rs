use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::series::PointRecord;
use crate::store::{PointUpdate, SeriesStore};
use crate::traits::Clock;

/// A row of the `time_points` table.
#[derive(Debug, Clone, FromRow)]
struct TimePointRow {
    time: DateTime<Utc>,
    prediction: Option<f64>,
    actual: Option<f64>,
    temperature: Option<f64>,
    wind_speed: Option<f64>,
    wind_gust: Option<f64>,
    icon: Option<String>,
}

impl From<TimePointRow> for PointRecord {
    fn from(row: TimePointRow) -> Self {
        Self {
            timestamp: row.time,
            prediction: row.prediction,
            actual: row.actual,
            temperature: row.temperature,
            wind_speed: row.wind_speed,
            wind_gust: row.wind_gust,
            icon: row.icon,
        }
    }
}

/// PostgreSQL-backed series store.
///
/// Opened at the start of a run and closed at its end; there is no process-wide
/// connection.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    /// Close the connection pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Export one farm's full series to a timestamped CSV file in `output_dir`.
    pub async fn export_to_csv<C: Clock>(
        &self,
        farm: &str,
        output_dir: &Path,
        clock: &C,
    ) -> Result<PathBuf> {
        let records = self
            .fetch(farm, None)
            .await
            .context("Failed to fetch series for export")?;

        let filename = format!(
            "{}_{}.csv",
            farm.to_lowercase(),
            clock.now_utc().format("%Y%m%d_%H%M%S")
        );
        let output_path = output_dir.join(filename);

        write_csv(output_path.clone(), records).await?;

        Ok(output_path)
    }
}

/// Write records to a CSV file on a blocking task.
pub async fn write_csv(path: PathBuf, records: Vec<PointRecord>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut wtr = csv::Writer::from_path(&path).context("Failed to create CSV writer")?;

        for record in records {
            wtr.serialize(record)
                .context("Failed to serialize record")?;
        }

        wtr.flush().context("Failed to flush CSV writer")?;
        Ok(())
    })
    .await
    .context("CSV export task failed")??;

    Ok(())
}

impl SeriesStore for Database {
    async fn fetch(&self, farm: &str, limit: Option<usize>) -> Result<Vec<PointRecord>> {
        let rows = sqlx::query_as::<_, TimePointRow>(
            "SELECT time, prediction, actual, temperature, wind_speed, wind_gust, icon
             FROM time_points
             WHERE farm = $1
             ORDER BY time DESC
             LIMIT $2",
        )
        .bind(farm)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch series for {farm}"))?;

        // Newest-first from the query, oldest-first for callers
        Ok(rows.into_iter().rev().map(PointRecord::from).collect())
    }

    async fn fetch_observed(&self, farm: &str) -> Result<Vec<PointRecord>> {
        let rows = sqlx::query_as::<_, TimePointRow>(
            "SELECT time, prediction, actual, temperature, wind_speed, wind_gust, icon
             FROM time_points
             WHERE farm = $1 AND actual IS NOT NULL
             ORDER BY time ASC",
        )
        .bind(farm)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch observed hours for {farm}"))?;

        Ok(rows.into_iter().map(PointRecord::from).collect())
    }

    async fn latest_observed(&self, farm: &str) -> Result<Option<PointRecord>> {
        let row = sqlx::query_as::<_, TimePointRow>(
            "SELECT time, prediction, actual, temperature, wind_speed, wind_gust, icon
             FROM time_points
             WHERE farm = $1 AND actual IS NOT NULL
             ORDER BY time DESC
             LIMIT 1",
        )
        .bind(farm)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch latest observation for {farm}"))?;

        Ok(row.map(PointRecord::from))
    }

    async fn upsert(&self, farm: &str, updates: &[PointUpdate]) -> Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start upsert transaction")?;

        for update in updates {
            sqlx::query(
                "INSERT INTO time_points (
                    farm, time, prediction, actual, temperature, wind_speed, wind_gust, icon
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (farm, time) DO UPDATE SET
                    prediction = COALESCE(EXCLUDED.prediction, time_points.prediction),
                    actual = COALESCE(EXCLUDED.actual, time_points.actual),
                    temperature = COALESCE(EXCLUDED.temperature, time_points.temperature),
                    wind_speed = COALESCE(EXCLUDED.wind_speed, time_points.wind_speed),
                    wind_gust = COALESCE(EXCLUDED.wind_gust, time_points.wind_gust),
                    icon = COALESCE(EXCLUDED.icon, time_points.icon),
                    updated_at = NOW()",
            )
            .bind(farm)
            .bind(update.timestamp)
            .bind(update.prediction)
            .bind(update.actual)
            .bind(update.temperature)
            .bind(update.wind_speed)
            .bind(update.wind_gust)
            .bind(update.icon.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert {} for {farm}", update.timestamp))?;
        }

        tx.commit()
            .await
            .context("Failed to commit upsert transaction")?;

        Ok(updates.len())
    }
}
