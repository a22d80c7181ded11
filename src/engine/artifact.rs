//! Model Version Artifacts
//!
//! One fitted generation of the engine: the cluster model, the per-regime
//! ensemble, and the derived regime names, bundled with its training window
//! and persisted as JSON. Once written, an artifact is never modified;
//! retraining produces a new version.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::detector::{
    DetectorConfig, DetectorFitError, FittedClusterModel, RegimeDetector, RegimeLabel,
};
use crate::engine::ensemble::{
    EnsembleConfig, EnsembleFitError, LabeledObservation, RegimeModelEnsemble,
};
use crate::engine::naming::{derive_regime_names, NamingRules};
use crate::engine::state::StateVector;
use crate::engine::stress::{StressError, StressRunResult, StressScenario, StressTester};

/// A complete fitted generation. `regime_id`s are only meaningful within
/// one version; comparisons across versions go through regime names and
/// centroid profiles, never raw ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    /// Derived from the fit timestamp, e.g. `v20240301T120000Z`.
    pub version_id: String,
    pub fitted_at: DateTime<Utc>,
    /// First and last training timestamps.
    pub training_window: (DateTime<Utc>, DateTime<Utc>),
    pub zone: String,
    pub cluster: FittedClusterModel,
    pub ensemble: RegimeModelEnsemble,
    pub regime_names: BTreeMap<usize, String>,
}

/// Fatal to a full fit. No version is produced; any prior version stays
/// in service.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionFitError {
    Detector(DetectorFitError),
    Ensemble(EnsembleFitError),
    /// Target series does not align one-to-one with the state vectors.
    TargetLengthMismatch { vectors: usize, targets: usize },
}

impl std::fmt::Display for VersionFitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detector(e) => write!(f, "regime detection failed: {}", e),
            Self::Ensemble(e) => write!(f, "ensemble fit failed: {}", e),
            Self::TargetLengthMismatch { vectors, targets } => {
                write!(f, "{} state vectors but {} targets", vectors, targets)
            }
        }
    }
}

impl std::error::Error for VersionFitError {}

impl From<DetectorFitError> for VersionFitError {
    fn from(e: DetectorFitError) -> Self {
        Self::Detector(e)
    }
}

impl From<EnsembleFitError> for VersionFitError {
    fn from(e: EnsembleFitError) -> Self {
        Self::Ensemble(e)
    }
}

impl ModelVersion {
    /// Fit a full generation: cluster the vectors, label them, fit the
    /// per-regime ensemble on the aligned targets, derive names.
    ///
    /// `targets[i]` is the observed price pressure for `vectors[i]`.
    pub fn fit(
        zone: &str,
        vectors: &[StateVector],
        targets: &[f64],
        detector_config: &DetectorConfig,
        ensemble_config: &EnsembleConfig,
        naming_rules: &NamingRules,
    ) -> Result<ModelVersion, VersionFitError> {
        if vectors.len() != targets.len() {
            return Err(VersionFitError::TargetLengthMismatch {
                vectors: vectors.len(),
                targets: targets.len(),
            });
        }

        let detector = RegimeDetector::new(detector_config.clone());
        let (cluster, labels) = detector.fit_assign(vectors)?;

        let rows: Vec<LabeledObservation> = vectors
            .iter()
            .zip(&labels)
            .zip(targets)
            .map(|((state, label), &target)| LabeledObservation {
                state: state.clone(),
                label: *label,
                target,
            })
            .collect();
        let ensemble = RegimeModelEnsemble::fit(&rows, ensemble_config)?;

        let regime_names = derive_regime_names(&cluster, naming_rules);

        let fitted_at = Utc::now();
        let window = training_window(vectors);
        let version = ModelVersion {
            version_id: format!("v{}", fitted_at.format("%Y%m%dT%H%M%SZ")),
            fitted_at,
            training_window: window,
            zone: zone.to_string(),
            cluster,
            ensemble,
            regime_names,
        };
        info!(
            version_id = %version.version_id,
            zone,
            k = version.cluster.k,
            n_samples = version.cluster.n_samples,
            "model version fitted"
        );
        Ok(version)
    }

    /// Label one state vector with this version's cluster model.
    pub fn assign(
        &self,
        vector: &StateVector,
    ) -> Result<RegimeLabel, crate::engine::detector::AssignError> {
        self.cluster.assign(vector)
    }

    /// Run one stress scenario against this version.
    pub fn stress(&self, scenario: &StressScenario) -> Result<StressRunResult, StressError> {
        StressTester::new(&self.cluster, &self.ensemble).run(scenario)
    }

    /// Display name for a regime id, falling back to the numeric id.
    pub fn regime_name(&self, regime_id: usize) -> String {
        self.regime_names
            .get(&regime_id)
            .cloned()
            .unwrap_or_else(|| format!("regime-{regime_id}"))
    }

    /// Persist as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .with_context(|| format!("serializing model version {}", self.version_id))?;
        fs::write(path, json)
            .with_context(|| format!("writing model version to {}", path.display()))?;
        info!(version_id = %self.version_id, path = %path.display(), "model version saved");
        Ok(())
    }

    /// Load a previously saved version.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<ModelVersion> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading model version from {}", path.display()))?;
        let version: ModelVersion = serde_json::from_str(&json)
            .with_context(|| format!("parsing model version from {}", path.display()))?;
        info!(version_id = %version.version_id, path = %path.display(), "model version loaded");
        Ok(version)
    }
}

fn training_window(vectors: &[StateVector]) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut start = vectors[0].timestamp;
    let mut end = vectors[0].timestamp;
    for v in vectors {
        start = start.min(v.timestamp);
        end = end.max(v.timestamp);
    }
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::synthetic_vector;

    fn fit_version() -> ModelVersion {
        let mut vectors = Vec::new();
        for i in 0..60 {
            vectors.push(synthetic_vector(2 * i, 0.2 + (i % 5) as f64 * 0.004, 100.0, 10.0));
            vectors.push(synthetic_vector(2 * i + 1, 0.8 - (i % 5) as f64 * 0.004, -100.0, 40.0));
        }
        let targets: Vec<f64> = vectors
            .iter()
            .map(|v| 20.0 * v.res_penetration + 0.01 * v.net_import)
            .collect();
        ModelVersion::fit(
            "DE",
            &vectors,
            &targets,
            &DetectorConfig { k_range: 2..=3, ..DetectorConfig::default() },
            &EnsembleConfig { min_samples_per_regime: 10, ..EnsembleConfig::default() },
            &NamingRules::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_fit_produces_consistent_version() {
        let version = fit_version();
        assert_eq!(version.cluster.k, 2);
        assert_eq!(version.regime_names.len(), 2);
        assert!(version.version_id.starts_with('v'));
        assert!(version.training_window.0 < version.training_window.1);

        let names: Vec<&String> = version.regime_names.values().collect();
        assert!(names.iter().any(|n| *n == "Fossil-Heavy"));
        assert!(names.iter().any(|n| *n == "RES-Dominant"));
    }

    #[test]
    fn test_target_length_mismatch_rejected() {
        let vectors: Vec<StateVector> =
            (0..50).map(|i| synthetic_vector(i, 0.3, 0.0, 5.0)).collect();
        let err = ModelVersion::fit(
            "DE",
            &vectors,
            &[1.0; 10],
            &DetectorConfig::default(),
            &EnsembleConfig::default(),
            &NamingRules::default(),
        )
        .unwrap_err();
        assert_eq!(err, VersionFitError::TargetLengthMismatch { vectors: 50, targets: 10 });
    }

    #[test]
    fn test_json_round_trip() {
        let version = fit_version();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_version.json");

        version.save(&path).unwrap();
        let loaded = ModelVersion::load(&path).unwrap();
        assert_eq!(version, loaded);

        // Reloaded model assigns identically.
        let probe = synthetic_vector(500, 0.25, 80.0, 12.0);
        assert_eq!(version.assign(&probe).unwrap(), loaded.assign(&probe).unwrap());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelVersion::load(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("reading model version"));
    }
}
