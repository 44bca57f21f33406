//! Per-farm power models.
//!
//! Each farm gets a linear least-squares model over standardized
//! [`FeatureRow`] inputs. The fitted weights are plain numbers, so the whole
//! model set is persisted as JSON and reloaded by every scheduled run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::FeatureRow;

/// Errors that can occur while fitting, saving or loading models.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Insufficient data for training: {0} samples")]
    InsufficientData(usize),
    #[error("Feature and target lengths mismatch: {features} vs {targets}")]
    MismatchedLengths { features: usize, targets: usize },
    #[error("Least squares system could not be solved")]
    Singular,
    #[error("Model file not found: {0}")]
    FileNotFound(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Model version mismatch: expected v{expected}, found v{found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Linear model `output = intercept + Σ weight_i * (x_i - mean_i) / scale_i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerModel {
    pub intercept: f64,
    pub weights: Vec<f64>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub training_samples: usize,
    pub training_mse: f64,
}

impl PowerModel {
    /// Fit a model; needs at least `min_samples` rows.
    pub fn fit(
        features: &[FeatureRow],
        targets: &[f64],
        min_samples: usize,
    ) -> Result<Self, ModelError> {
        if features.len() != targets.len() {
            return Err(ModelError::MismatchedLengths {
                features: features.len(),
                targets: targets.len(),
            });
        }
        if features.is_empty() || features.len() < min_samples {
            return Err(ModelError::InsufficientData(features.len()));
        }

        let n_samples = features.len();
        let n_features = FeatureRow::NUM_FEATURES;
        let rows: Vec<Vec<f64>> = features.iter().map(FeatureRow::to_vec).collect();
        let (means, scales) = column_stats(&rows);

        // Leading column of ones for the intercept
        let mut design = Vec::with_capacity(n_samples * (n_features + 1));
        for row in &rows {
            design.push(1.0);
            design.extend(standardize(row, &means, &scales));
        }

        let x = DMatrix::from_row_slice(n_samples, n_features + 1, &design);
        let y = DVector::from_column_slice(targets);
        let beta = solve_least_squares(&x, &y).ok_or(ModelError::Singular)?;

        let mut model = Self {
            intercept: beta[0],
            weights: beta.iter().skip(1).copied().collect(),
            means,
            scales,
            training_samples: n_samples,
            training_mse: 0.0,
        };

        let predictions: Vec<f64> = features.iter().map(|f| model.predict(f)).collect();
        model.training_mse = calculate_mse(&predictions, targets);

        Ok(model)
    }

    /// Raw model output in MW. Callers clamp before storing.
    pub fn predict(&self, features: &FeatureRow) -> f64 {
        let row = features.to_vec();
        self.intercept
            + standardize(&row, &self.means, &self.scales)
                .zip(&self.weights)
                .map(|(x, w)| x * w)
                .sum::<f64>()
    }
}

fn column_stats(rows: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len() as f64;
    let width = rows.first().map_or(0, Vec::len);

    let means: Vec<f64> = (0..width)
        .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n)
        .collect();
    let scales = (0..width)
        .map(|j| {
            let variance = rows.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();
            // Constant columns stay centred at zero
            if std_dev > f64::EPSILON { std_dev } else { 1.0 }
        })
        .collect();

    (means, scales)
}

fn standardize<'a>(
    row: &'a [f64],
    means: &'a [f64],
    scales: &'a [f64],
) -> impl Iterator<Item = f64> + 'a {
    row.iter()
        .zip(means)
        .zip(scales)
        .map(|((x, mean), scale)| (x - mean) / scale)
}

/// Solve a least squares problem using SVD.
///
/// Returns `None` if no finite solution is found.
fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Calculate mean squared error.
fn calculate_mse(predictions: &[f64], targets: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != targets.len() {
        return f64::MAX;
    }

    let sum_sq_error: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).powi(2))
        .sum();

    sum_sq_error / predictions.len() as f64
}

/// Trained models for every farm, as saved by `retrain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSet {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub models: BTreeMap<String, PowerModel>,
}

impl ModelSet {
    /// Current version number
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            created_at,
            models: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, farm: &str, model: PowerModel) {
        self.models.insert(farm.to_string(), model);
    }

    pub fn get(&self, farm: &str) -> Option<&PowerModel> {
        self.models.get(farm)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Save as JSON, creating parent directories if needed.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ModelError::Io(e.to_string()))?;
        }

        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| ModelError::Serialize(e.to_string()))?;

        fs::write(path, bytes).map_err(|e| ModelError::Io(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::FileNotFound(path.to_string_lossy().to_string()));
        }

        let bytes = fs::read(path).map_err(|e| ModelError::Io(e.to_string()))?;
        let set: Self =
            serde_json::from_slice(&bytes).map_err(|e| ModelError::Serialize(e.to_string()))?;

        if set.version > Self::CURRENT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: set.version,
            });
        }

        Ok(set)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        let farms: Vec<String> = self
            .models
            .iter()
            .map(|(farm, m)| {
                format!("{farm}({} samples, mse={:.2})", m.training_samples, m.training_mse)
            })
            .collect();

        format!(
            "ModelSet v{} created {}: {}",
            self.version,
            self.created_at.format("%Y-%m-%d %H:%M UTC"),
            if farms.is_empty() { "no models".to_string() } else { farms.join(", ") }
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    use super::*;

    fn create_test_data(n: usize) -> (Vec<FeatureRow>, Vec<f64>) {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let wind = 3.0 + (i % 17) as f64 * 0.7;
                let gust = wind * 1.2 + (i % 5) as f64 * 0.3;
                let temp = 10.0 + (i % 11) as f64;
                let row = FeatureRow::from_weather(
                    start + Duration::hours(i as i64),
                    Some(wind),
                    Some(gust),
                    Some(temp),
                )
                .unwrap();
                let target = 3.0 + 2.0 * wind + 0.05 * wind.powi(3) - 0.5 * temp;
                (row, target)
            })
            .unzip()
    }

    #[test]
    fn test_fit_recovers_linear_relationship() {
        let (features, targets) = create_test_data(200);

        let model = PowerModel::fit(&features, &targets, 10).unwrap();

        assert_eq!(model.training_samples, 200);
        assert!(model.training_mse < 1e-8, "mse was {}", model.training_mse);
        for (row, target) in features.iter().zip(&targets).take(20) {
            assert_relative_eq!(model.predict(row), *target, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_fit_empty_data() {
        let result = PowerModel::fit(&[], &[], 0);
        assert_eq!(result, Err(ModelError::InsufficientData(0)));
    }

    #[test]
    fn test_fit_below_minimum() {
        let (features, targets) = create_test_data(20);
        let result = PowerModel::fit(&features, &targets, 48);
        assert_eq!(result, Err(ModelError::InsufficientData(20)));
    }

    #[test]
    fn test_fit_mismatched_lengths() {
        let (features, _) = create_test_data(10);
        let result = PowerModel::fit(&features, &[1.0; 5], 1);
        assert!(matches!(result, Err(ModelError::MismatchedLengths { .. })));
    }

    #[test]
    fn test_constant_column_does_not_break_fit() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        // Same hour every day: hour_sin/hour_cos are constant
        let features: Vec<FeatureRow> = (0..30)
            .map(|i| {
                FeatureRow::from_weather(
                    start + Duration::days(i),
                    Some(4.0 + i as f64 * 0.3),
                    None,
                    Some(15.0 + (i % 4) as f64),
                )
                .unwrap()
            })
            .collect();
        let targets: Vec<f64> = features.iter().map(|f| 5.0 * f.wind_speed).collect();

        let model = PowerModel::fit(&features, &targets, 10).unwrap();

        assert_relative_eq!(model.predict(&features[3]), targets[3], epsilon = 1e-6);
    }

    #[test]
    fn test_calculate_mse() {
        let predictions = vec![10.0, 20.0, 30.0];
        let targets = vec![12.0, 18.0, 32.0];

        let mse = calculate_mse(&predictions, &targets);

        assert!((mse - 4.0).abs() < 1e-10);
    }

    // ==================== Persistence Tests ====================

    fn create_test_set() -> ModelSet {
        let (features, targets) = create_test_data(100);
        let mut set = ModelSet::new(Utc.with_ymd_and_hms(2024, 6, 20, 0, 0, 0).unwrap());
        set.insert("SNOWTWN1", PowerModel::fit(&features, &targets, 10).unwrap());
        set
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.json");

        let set = create_test_set();
        set.save(&path).unwrap();

        let loaded = ModelSet::load(&path).unwrap();
        assert_eq!(loaded.version, ModelSet::CURRENT_VERSION);
        assert_eq!(loaded.models.len(), 1);
        assert!(loaded.get("SNOWTWN1").is_some());
        assert_eq!(loaded.created_at, set.created_at);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dirs").join("models.json");

        create_test_set().save(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_load_nonexistent() {
        let result = ModelSet::load(Path::new("/nonexistent/path/models.json"));
        assert!(matches!(result, Err(ModelError::FileNotFound(_))));
    }

    #[test]
    fn test_load_rejects_newer_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.json");
        let mut set = create_test_set();
        set.version = ModelSet::CURRENT_VERSION + 1;
        set.save(&path).unwrap();

        let result = ModelSet::load(&path);

        assert_eq!(
            result,
            Err(ModelError::VersionMismatch {
                expected: ModelSet::CURRENT_VERSION,
                found: ModelSet::CURRENT_VERSION + 1,
            })
        );
    }

    #[test]
    fn test_summary() {
        let summary = create_test_set().summary();

        assert!(summary.contains("ModelSet v1"));
        assert!(summary.contains("SNOWTWN1(100 samples"));
    }
}
