// src/model.rs
//
// External model capabilities. The fusion engine only sees the traits;
// the artifact-backed implementations below stand in for the trained
// anomaly / density models behind them. A capability failing is never a
// caller-visible error — the engine degrades per contract.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::Error;
use crate::events::{Factor, FusedResult, Sample};
use crate::features::{FeatureVector, FIELD_NAMES};

/// How many factors the explanation capability reports.
const TOP_FACTORS: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct AnomalyVerdict {
    /// More negative = more anomalous.
    pub decision_score: f64,
    pub is_anomalous: bool,
}

pub trait AnomalyModel: Send + Sync {
    fn score(&self, features: &FeatureVector) -> Result<AnomalyVerdict, Error>;
}

pub trait DensityModel: Send + Sync {
    /// Distance from the sample to the nearest core point, if the model
    /// has core points at all.
    fn nearest_core_distance(&self, features: &FeatureVector) -> Result<Option<f64>, Error>;
    fn eps(&self) -> f64;
}

pub trait ExplanationModel: Send + Sync {
    /// Top factors by |contribution|. Must degrade to an empty list on any
    /// failure.
    fn explain(&self, features: &FeatureVector) -> Vec<Factor>;
}

pub trait PersistenceSink: Send + Sync {
    /// Fire-and-forget. Implementations log failures, never surface them.
    fn save(&self, result: &FusedResult, sample: &Sample);
}

/// Everything optional the pipeline can run with. A default-constructed
/// bundle means no models and no sink, which is a valid degraded mode.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub anomaly: Option<std::sync::Arc<dyn AnomalyModel>>,
    pub density: Option<std::sync::Arc<dyn DensityModel>>,
    pub explainer: Option<std::sync::Arc<dyn ExplanationModel>>,
    pub sink: Option<std::sync::Arc<dyn PersistenceSink>>,
}

// ── Artifact-backed model ─────────────────────────────────────────────────────
// JSON artifact exported by the training pipeline: standardisation
// parameters plus a linear decision function over the standardised
// features, and optionally the density model's core points.

#[derive(Debug, Deserialize)]
struct ModelArtifact {
    feature_names: Vec<String>,
    mean: Vec<f64>,
    std: Vec<f64>,
    weights: Vec<f64>,
    intercept: f64,
    #[serde(default)]
    core_points: Vec<Vec<f64>>,
    #[serde(default = "default_eps")]
    eps: f64,
}

fn default_eps() -> f64 {
    0.5
}

#[derive(Debug)]
pub struct LinearModel {
    mean: Vec<f64>,
    std: Vec<f64>,
    weights: Vec<f64>,
    intercept: f64,
    core_points: Vec<Vec<f64>>,
    eps: f64,
}

impl LinearModel {
    /// Load and validate an artifact. The declared feature schema must be
    /// byte-identical to [`FIELD_NAMES`] — a silent mismatch would corrupt
    /// every score.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("model read {}: {e}", path.display())))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("model parse {}: {e}", path.display())))?;

        let n = FIELD_NAMES.len();
        if artifact.feature_names != FIELD_NAMES {
            return Err(Error::Configuration(format!(
                "model feature schema mismatch: artifact declares {:?}",
                artifact.feature_names
            )));
        }
        if artifact.mean.len() != n || artifact.std.len() != n || artifact.weights.len() != n {
            return Err(Error::Configuration(format!(
                "model parameter vectors must all have length {n}"
            )));
        }
        if let Some(row) = artifact.core_points.iter().find(|row| row.len() != n) {
            return Err(Error::Configuration(format!(
                "core point of length {} does not match feature count {n}",
                row.len()
            )));
        }
        if !(artifact.eps > 0.0) {
            return Err(Error::Configuration(format!(
                "eps must be positive, got {}",
                artifact.eps
            )));
        }

        info!(
            core_points = artifact.core_points.len(),
            "model artifact loaded from {}",
            path.display()
        );
        Ok(Self {
            mean: artifact.mean,
            std: artifact.std,
            weights: artifact.weights,
            intercept: artifact.intercept,
            core_points: artifact.core_points,
            eps: artifact.eps,
        })
    }

    fn standardise(&self, features: &FeatureVector) -> Vec<f64> {
        features
            .as_array()
            .iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(x, (mean, std))| (x - mean) / std.max(1e-12))
            .collect()
    }
}

impl AnomalyModel for LinearModel {
    fn score(&self, features: &FeatureVector) -> Result<AnomalyVerdict, Error> {
        let scaled = self.standardise(features);
        let decision_score: f64 = scaled
            .iter()
            .zip(self.weights.iter())
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.intercept;
        Ok(AnomalyVerdict {
            decision_score,
            is_anomalous: decision_score < 0.0,
        })
    }
}

impl DensityModel for LinearModel {
    fn nearest_core_distance(&self, features: &FeatureVector) -> Result<Option<f64>, Error> {
        if self.core_points.is_empty() {
            return Ok(None);
        }
        let scaled = self.standardise(features);
        let nearest = self
            .core_points
            .iter()
            .map(|core| {
                core.iter()
                    .zip(scaled.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        Ok(Some(nearest))
    }

    fn eps(&self) -> f64 {
        self.eps
    }
}

impl ExplanationModel for LinearModel {
    fn explain(&self, features: &FeatureVector) -> Vec<Factor> {
        let scaled = self.standardise(features);
        let mut contributions: Vec<(usize, f64)> = scaled
            .iter()
            .zip(self.weights.iter())
            .map(|(x, w)| x * w)
            .enumerate()
            .collect();
        contributions.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let total_abs: f64 = contributions.iter().map(|(_, v)| v.abs()).sum();
        let total_abs = if total_abs > 0.0 { total_abs } else { 1.0 };
        contributions
            .into_iter()
            .take(TOP_FACTORS)
            .map(|(i, value)| Factor {
                name: FIELD_NAMES[i].to_string(),
                contribution: value,
                weight: value.abs() / total_abs,
            })
            .collect()
    }
}

// ── JSONL persistence sink ────────────────────────────────────────────────────

/// Appends every fused result to `results.jsonl` in the output directory.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(output_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            Error::Configuration(format!("cannot create {}: {e}", output_dir.display()))
        })?;
        Ok(Self {
            path: output_dir.join("results.jsonl"),
        })
    }

    fn append(&self, result: &FusedResult) -> std::io::Result<()> {
        let line = serde_json::to_string(result)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl PersistenceSink for JsonlSink {
    fn save(&self, result: &FusedResult, _sample: &Sample) {
        if let Err(e) = self.append(result) {
            warn!("persistence sink failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact_json(feature_names: &[&str]) -> String {
        let n = feature_names.len();
        json!({
            "feature_names": feature_names,
            "mean": vec![0.0; n],
            "std": vec![1.0; n],
            "weights": (0..n).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect::<Vec<f64>>(),
            "intercept": 0.1,
            "core_points": [vec![0.0; n]],
            "eps": 0.9,
        })
        .to_string()
    }

    fn write_artifact(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("georisk_model_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn model() -> LinearModel {
        let path = write_artifact("valid.json", &artifact_json(&FIELD_NAMES));
        LinearModel::from_path(&path).unwrap()
    }

    #[test]
    fn rejects_mismatched_feature_schema() {
        let mut names: Vec<&str> = FIELD_NAMES.to_vec();
        names.swap(0, 1);
        let path = write_artifact("reordered.json", &artifact_json(&names));
        let err = LinearModel::from_path(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn scores_with_linear_decision_function() {
        let m = model();
        // weights pick out avg_speed; everything else zeroed
        let features = FeatureVector {
            avg_speed: -1.0,
            ..FeatureVector::default()
        };
        let verdict = m.score(&features).unwrap();
        assert!((verdict.decision_score - (-0.9)).abs() < 1e-9);
        assert!(verdict.is_anomalous);

        let calm = m.score(&FeatureVector::default()).unwrap();
        assert!(!calm.is_anomalous);
    }

    #[test]
    fn density_distance_is_euclidean_to_nearest_core() {
        let m = model();
        let features = FeatureVector {
            avg_speed: 3.0,
            ..FeatureVector::default()
        };
        let d = m.nearest_core_distance(&features).unwrap().unwrap();
        assert!((d - 3.0).abs() < 1e-9);
        assert_eq!(m.eps(), 0.9);
    }

    #[test]
    fn explanation_ranks_by_contribution_magnitude() {
        let m = model();
        let features = FeatureVector {
            avg_speed: 5.0,
            max_speed: 100.0, // weight 0 so contributes nothing
            ..FeatureVector::default()
        };
        let factors = m.explain(&features);
        assert_eq!(factors.len(), TOP_FACTORS);
        assert_eq!(factors[0].name, "avg_speed");
        assert!((factors[0].contribution - 5.0).abs() < 1e-9);
        assert!((factors[0].weight - 1.0).abs() < 1e-9);
    }
}
