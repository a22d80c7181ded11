//! Regime Detection
//!
//! Partitions observed hours into a small number of discrete operating
//! regimes via k-means clustering over standardized state vectors.
//!
//! # Determinism Guarantees
//!
//! - **RNG**: seeded `ChaCha8Rng` only; each restart derives its seed from
//!   the configured base seed, so restarts are reproducible and may run on
//!   any number of worker threads
//! - **Trial selection**: lowest inertia wins, ties broken by lowest trial
//!   index — independent of execution order
//! - **Assignment**: [`FittedClusterModel::assign`] uses no randomness; the
//!   same fitted model and input always yield the same label
//!
//! Cluster ids are arbitrary per fit. Callers needing continuity across
//! retrains must re-derive the semantic name mapping (`engine::naming`)
//! after every fit.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::engine::state::{FeatureName, StateVector};

/// Guard against division by a zero scale or distance.
const EPS: f64 = 1e-9;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for [`RegimeDetector::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Candidate cluster counts; the separation score picks the winner,
    /// ties toward the smaller k.
    pub k_range: RangeInclusive<usize>,
    /// Random restarts per candidate k; lowest inertia kept.
    pub n_init: usize,
    /// Lloyd iteration cap per restart.
    pub max_iterations: usize,
    /// Base RNG seed. Fits with the same seed and input are identical.
    pub seed: u64,
    /// Confidence below this marks an hour as a transition hour.
    pub low_confidence_threshold: f64,
    /// Features to cluster on, in fixed order.
    pub feature_names: Vec<FeatureName>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            k_range: 2..=6,
            n_init: 10,
            max_iterations: 100,
            seed: 42,
            low_confidence_threshold: 0.4,
            feature_names: FeatureName::CORE.to_vec(),
        }
    }
}

// =============================================================================
// LABELS AND FITTED MODEL
// =============================================================================

/// Regime assignment for one state vector.
///
/// `regime_id` is stable only within one fitted model generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabel {
    pub regime_id: usize,
    /// 1 - d1/d2 over standardized distances to the nearest and
    /// second-nearest centroids. 1.0 = unambiguous, near 0 = transition hour.
    pub confidence: f64,
    pub is_low_confidence: bool,
}

/// Immutable clustering artifact. A new training run produces a new
/// instance; nothing mutates a fitted model in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedClusterModel {
    /// Feature schema in fixed order.
    pub feature_names: Vec<FeatureName>,
    /// Per-feature standardization mean.
    pub means: Vec<f64>,
    /// Per-feature standardization scale (population std dev, floored).
    pub scales: Vec<f64>,
    /// Cluster centroids in standardized space, `k` rows.
    pub centroids: Vec<Vec<f64>>,
    /// Chosen cluster count.
    pub k: usize,
    /// Per-feature observed (min, max) in raw space over the training set.
    /// The stress tester uses this for its `extrapolated` flag.
    pub training_ranges: Vec<(f64, f64)>,
    /// Winning run's within-cluster sum of squared distances.
    pub inertia: f64,
    /// Separation score of the chosen k.
    pub separation_score: f64,
    /// Training sample count.
    pub n_samples: usize,
    /// Threshold applied for `is_low_confidence`.
    pub low_confidence_threshold: f64,
}

impl FittedClusterModel {
    /// Standardize one raw feature row with the stored fit parameters.
    fn standardize(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }

    /// Centroid of `regime_id` de-standardized back into raw feature units.
    /// Used by the semantic naming lookup and regime profiles.
    pub fn centroid_raw(&self, regime_id: usize) -> Option<Vec<f64>> {
        self.centroids.get(regime_id).map(|c| {
            c.iter()
                .zip(self.means.iter().zip(&self.scales))
                .map(|(z, (m, s))| z * s + m)
                .collect()
        })
    }

    /// Assign a state vector to its nearest regime.
    ///
    /// Standardizes with the stored parameters (never refits), computes the
    /// distance to every centroid, and returns the nearest centroid's id
    /// with the confidence score. Deterministic: no randomness here.
    pub fn assign(&self, vector: &StateVector) -> Result<RegimeLabel, AssignError> {
        let raw = extract_features(vector, &self.feature_names).map_err(|feature| {
            AssignError::MissingFeature { feature, timestamp: vector.timestamp }
        })?;
        let z = self.standardize(&raw);

        let mut nearest = (0usize, f64::INFINITY);
        let mut second = f64::INFINITY;
        for (id, centroid) in self.centroids.iter().enumerate() {
            let d = euclidean(&z, centroid);
            if !d.is_finite() {
                return Err(AssignError::NonFinite { timestamp: vector.timestamp });
            }
            if d < nearest.1 {
                second = nearest.1;
                nearest = (id, d);
            } else if d < second {
                second = d;
            }
        }

        let confidence = if self.k <= 1 {
            1.0
        } else {
            (1.0 - nearest.1 / (second + EPS)).clamp(0.0, 1.0)
        };

        Ok(RegimeLabel {
            regime_id: nearest.0,
            confidence,
            is_low_confidence: confidence < self.low_confidence_threshold,
        })
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal to a fit attempt: not enough vectors to support the requested
/// cluster counts. No model is produced; any prior version stays in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientDataError {
    pub required: usize,
    pub supplied: usize,
}

impl std::fmt::Display for InsufficientDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient data for regime fit: {} vectors supplied, {} required",
            self.supplied, self.required
        )
    }
}

impl std::error::Error for InsufficientDataError {}

/// Failure to fit a cluster model.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorFitError {
    InsufficientData(InsufficientDataError),
    /// A training vector lacks a feature the configured schema requires.
    MissingFeature { feature: FeatureName, timestamp: DateTime<Utc> },
    /// Empty k_range or zero restarts.
    InvalidConfig { reason: String },
}

impl std::fmt::Display for DetectorFitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData(e) => e.fmt(f),
            Self::MissingFeature { feature, timestamp } => {
                write!(f, "vector at {} lacks feature {}", timestamp, feature)
            }
            Self::InvalidConfig { reason } => write!(f, "invalid detector config: {}", reason),
        }
    }
}

impl std::error::Error for DetectorFitError {}

impl From<InsufficientDataError> for DetectorFitError {
    fn from(e: InsufficientDataError) -> Self {
        Self::InsufficientData(e)
    }
}

/// Failure to assign a single vector. A non-finite distance aborts the
/// row's result rather than propagating silently.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignError {
    MissingFeature { feature: FeatureName, timestamp: DateTime<Utc> },
    NonFinite { timestamp: DateTime<Utc> },
}

impl std::fmt::Display for AssignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFeature { feature, timestamp } => {
                write!(f, "vector at {} lacks feature {}", timestamp, feature)
            }
            Self::NonFinite { timestamp } => {
                write!(f, "non-finite distance computed for vector at {}", timestamp)
            }
        }
    }
}

impl std::error::Error for AssignError {}

/// Pull the schema features out of a vector; `Err` names the missing one.
fn extract_features(vector: &StateVector, names: &[FeatureName]) -> Result<Vec<f64>, FeatureName> {
    names
        .iter()
        .map(|&name| vector.feature(name).ok_or(name))
        .collect()
}

// =============================================================================
// DETECTOR
// =============================================================================

/// Fits cluster models over state vectors. Holds configuration only; every
/// fit produces a fresh, immutable [`FittedClusterModel`].
#[derive(Debug, Clone, Default)]
pub struct RegimeDetector {
    config: DetectorConfig,
}

impl RegimeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Fit a cluster model, selecting k from the configured range by the
    /// separation score (ties toward smaller k) and keeping the lowest-
    /// inertia restart per k.
    pub fn fit(&self, vectors: &[StateVector]) -> Result<FittedClusterModel, DetectorFitError> {
        let cfg = &self.config;
        let k_min = *cfg.k_range.start();
        let k_max = *cfg.k_range.end();
        if k_min == 0 || k_min > k_max {
            return Err(DetectorFitError::InvalidConfig {
                reason: format!("k_range {}..={} is empty or starts at zero", k_min, k_max),
            });
        }
        if cfg.n_init == 0 {
            return Err(DetectorFitError::InvalidConfig {
                reason: "n_init must be at least 1".to_string(),
            });
        }

        let required = k_min * 10;
        if vectors.len() < required {
            return Err(InsufficientDataError { required, supplied: vectors.len() }.into());
        }

        // Raw feature matrix, schema order.
        let mut raw: Vec<Vec<f64>> = Vec::with_capacity(vectors.len());
        for v in vectors {
            raw.push(extract_features(v, &cfg.feature_names).map_err(|feature| {
                DetectorFitError::MissingFeature { feature, timestamp: v.timestamp }
            })?);
        }

        let dim = cfg.feature_names.len();
        let (means, scales) = standardization_params(&raw, dim);
        let data: Vec<Vec<f64>> = raw
            .iter()
            .map(|row| {
                row.iter()
                    .zip(means.iter().zip(&scales))
                    .map(|(x, (m, s))| (x - m) / s)
                    .collect()
            })
            .collect();

        let training_ranges = (0..dim)
            .map(|j| {
                let col = raw.iter().map(|r| r[j]);
                col.clone().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                    (lo.min(x), hi.max(x))
                })
            })
            .collect::<Vec<_>>();

        // One run per candidate k: best-of-n_init restarts, then the
        // separation score arbitrates between k values.
        let mut best: Option<(usize, KMeansRun, f64)> = None;
        for k in k_min..=k_max.min(vectors.len()) {
            let run = best_of_restarts(&data, k, cfg);
            let score = separation_score(&data, &run);
            debug!(k, inertia = run.inertia, score, "regime candidate evaluated");
            // Strictly-greater keeps the smaller k on ties.
            let better = match &best {
                None => true,
                Some((_, _, best_score)) => score > *best_score,
            };
            if better {
                best = Some((k, run, score));
            }
        }
        let (k, run, score) =
            best.expect("k_range validated non-empty before candidate loop");

        info!(
            k,
            inertia = run.inertia,
            separation = score,
            n_samples = vectors.len(),
            "regime cluster model fitted"
        );

        Ok(FittedClusterModel {
            feature_names: cfg.feature_names.clone(),
            means,
            scales,
            centroids: run.centroids,
            k,
            training_ranges,
            inertia: run.inertia,
            separation_score: score,
            n_samples: vectors.len(),
            low_confidence_threshold: cfg.low_confidence_threshold,
        })
    }

    /// Fit and label the training set in one pass.
    pub fn fit_assign(
        &self,
        vectors: &[StateVector],
    ) -> Result<(FittedClusterModel, Vec<RegimeLabel>), DetectorFitError> {
        let model = self.fit(vectors)?;
        let labels = vectors
            .iter()
            .map(|v| {
                model.assign(v).expect("training vectors validated during fit")
            })
            .collect();
        Ok((model, labels))
    }
}

// =============================================================================
// K-MEANS INTERNALS
// =============================================================================

struct KMeansRun {
    centroids: Vec<Vec<f64>>,
    assignment: Vec<usize>,
    inertia: f64,
}

/// Run `n_init` seeded restarts in parallel; each trial writes its private
/// result and the lowest inertia wins, ties broken by trial index so the
/// outcome is independent of thread scheduling.
fn best_of_restarts(data: &[Vec<f64>], k: usize, cfg: &DetectorConfig) -> KMeansRun {
    let runs: Vec<(usize, KMeansRun)> = (0..cfg.n_init)
        .into_par_iter()
        .map(|trial| {
            let seed = cfg
                .seed
                .wrapping_add((k as u64) << 32)
                .wrapping_add(trial as u64);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (trial, lloyd(data, k, &mut rng, cfg.max_iterations))
        })
        .collect();

    runs.into_iter()
        .min_by(|(ta, a), (tb, b)| {
            a.inertia
                .partial_cmp(&b.inertia)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ta.cmp(tb))
        })
        .map(|(_, run)| run)
        .expect("n_init validated >= 1")
}

/// One k-means run: k-means++ seeding then Lloyd iterations. Empty clusters
/// are reseeded to the point farthest from its centroid.
fn lloyd(data: &[Vec<f64>], k: usize, rng: &mut ChaCha8Rng, max_iterations: usize) -> KMeansRun {
    let mut centroids = kmeans_pp_init(data, k, rng);
    let mut assignment = vec![0usize; data.len()];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (i, point) in data.iter().enumerate() {
            let nearest = nearest_centroid(point, &centroids);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }

        let dim = centroids[0].len();
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &c) in data.iter().zip(&assignment) {
            counts[c] += 1;
            for (acc, x) in sums[c].iter_mut().zip(point) {
                *acc += x;
            }
        }
        for (c, (sum, &count)) in sums.iter().zip(&counts).enumerate() {
            if count == 0 {
                // Reseed an empty cluster to the worst-explained point.
                let far = data
                    .iter()
                    .enumerate()
                    .max_by(|(ia, a), (ib, b)| {
                        let da = squared_distance(a, &centroids[assignment[*ia]]);
                        let db = squared_distance(b, &centroids[assignment[*ib]]);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centroids[c] = data[far].clone();
                changed = true;
            } else {
                centroids[c] = sum.iter().map(|s| s / count as f64).collect();
            }
        }

        if !changed {
            break;
        }
    }

    let inertia = data
        .iter()
        .zip(&assignment)
        .map(|(p, &c)| squared_distance(p, &centroids[c]))
        .sum();

    KMeansRun { centroids, assignment, inertia }
}

/// k-means++ seeding: first centroid uniform, each later one drawn with
/// probability proportional to squared distance from the nearest chosen.
fn kmeans_pp_init(data: &[Vec<f64>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())].clone());

    let mut d2: Vec<f64> = data
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = d2.iter().sum();
        let next = if total <= EPS {
            // All mass on already-chosen points; fall back to uniform.
            rng.gen_range(0..data.len())
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = data.len() - 1;
            for (i, w) in d2.iter().enumerate() {
                target -= w;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.push(data[next].clone());
        for (slot, p) in d2.iter_mut().zip(data) {
            *slot = slot.min(squared_distance(p, centroids.last().unwrap()));
        }
    }
    centroids
}

/// Centroid-based simplified silhouette: mean of (b - a) / max(a, b) where
/// a is the distance to the own centroid and b to the nearest other one.
/// O(n·k); adequate for the small hourly samples this engine sees.
fn separation_score(data: &[Vec<f64>], run: &KMeansRun) -> f64 {
    if run.centroids.len() < 2 {
        return -1.0;
    }
    let mut total = 0.0;
    for (point, &own) in data.iter().zip(&run.assignment) {
        let a = euclidean(point, &run.centroids[own]);
        let b = run
            .centroids
            .iter()
            .enumerate()
            .filter(|(c, _)| *c != own)
            .map(|(_, centroid)| euclidean(point, centroid))
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > EPS {
            total += (b - a) / denom;
        }
    }
    total / data.len() as f64
}

fn standardization_params(raw: &[Vec<f64>], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let mut means = Vec::with_capacity(dim);
    let mut scales = Vec::with_capacity(dim);
    for j in 0..dim {
        let col: Vec<f64> = raw.iter().map(|r| r[j]).collect();
        means.push(col.iter().mean());
        scales.push(col.iter().population_std_dev().max(EPS));
    }
    (means, scales)
}

fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            squared_distance(point, a)
                .partial_cmp(&squared_distance(point, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::synthetic_vector;

    fn two_cluster_vectors() -> Vec<StateVector> {
        let mut vectors = Vec::new();
        for i in 0..50 {
            let jitter = (i as f64 % 10.0) * 0.002;
            vectors.push(synthetic_vector(i, 0.2 + jitter, 100.0 + jitter, 10.0));
            vectors.push(synthetic_vector(i + 50, 0.8 - jitter, -100.0 - jitter, 10.0));
        }
        vectors
    }

    #[test]
    fn test_two_cluster_data_selects_k2_with_clean_membership() {
        let vectors = two_cluster_vectors();
        let detector = RegimeDetector::new(DetectorConfig {
            k_range: 2..=3,
            ..DetectorConfig::default()
        });
        let (model, labels) = detector.fit_assign(&vectors).unwrap();
        assert_eq!(model.k, 2);

        // Vectors alternate between the two origin groups.
        let low: Vec<usize> = labels.iter().step_by(2).map(|l| l.regime_id).collect();
        let high: Vec<usize> = labels.iter().skip(1).step_by(2).map(|l| l.regime_id).collect();
        let low_majority = low.iter().filter(|&&id| id == low[0]).count();
        let high_majority = high.iter().filter(|&&id| id == high[0]).count();
        assert!(low_majority >= 45, "low-res cluster split: {low_majority}/50");
        assert!(high_majority >= 45, "high-res cluster split: {high_majority}/50");
        assert_ne!(low[0], high[0], "origin groups must land in distinct regimes");
    }

    #[test]
    fn test_three_cluster_data_selects_k3() {
        // Three equally spaced phases along the res/net diagonal; volatility
        // is constant so it cannot lure the score into over-segmenting.
        let mut vectors = Vec::new();
        for i in 0..40 {
            let jitter = (i % 9) as f64 * 0.005;
            vectors.push(synthetic_vector(3 * i, 0.15 + jitter, 300.0, 0.0));
            vectors.push(synthetic_vector(3 * i + 1, 0.45 + jitter, 0.0, 0.0));
            vectors.push(synthetic_vector(3 * i + 2, 0.75 + jitter, -300.0, 0.0));
        }
        let model = RegimeDetector::new(DetectorConfig {
            k_range: 2..=5,
            ..DetectorConfig::default()
        })
        .fit(&vectors)
        .unwrap();
        assert_eq!(model.k, 3);
    }

    #[test]
    fn test_insufficient_data_rejected() {
        let vectors: Vec<_> = (0..19).map(|i| synthetic_vector(i, 0.5, 0.0, 1.0)).collect();
        let err = RegimeDetector::default().fit(&vectors).unwrap_err();
        match err {
            DetectorFitError::InsufficientData(e) => {
                assert_eq!(e.required, 20);
                assert_eq!(e.supplied, 19);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn test_fit_is_reproducible_for_same_seed() {
        let vectors = two_cluster_vectors();
        let detector = RegimeDetector::default();
        let a = detector.fit(&vectors).unwrap();
        let b = detector.fit(&vectors).unwrap();
        assert_eq!(a.k, b.k);
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.inertia, b.inertia);
    }

    #[test]
    fn test_assign_deterministic() {
        let vectors = two_cluster_vectors();
        let model = RegimeDetector::default().fit(&vectors).unwrap();
        let probe = synthetic_vector(999, 0.35, 20.0, 10.0);

        let first = model.assign(&probe).unwrap();
        let second = model.assign(&probe).unwrap();
        assert_eq!(first.regime_id, second.regime_id);
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn test_confidence_decreases_toward_boundary() {
        let vectors = two_cluster_vectors();
        let model = RegimeDetector::default().fit(&vectors).unwrap();

        // Walk from one raw centroid toward the midpoint between the two.
        let c0 = model.centroid_raw(0).unwrap();
        let c1 = model.centroid_raw(1).unwrap();
        let mid: Vec<f64> = c0.iter().zip(&c1).map(|(a, b)| (a + b) / 2.0).collect();

        let mut previous = f64::INFINITY;
        for step in 0..=10 {
            let t = step as f64 / 10.0;
            let p: Vec<f64> = c0.iter().zip(&mid).map(|(a, b)| a + t * (b - a)).collect();
            let probe = synthetic_vector(step, p[0], p[1], p[2]);
            let label = model.assign(&probe).unwrap();
            assert!(
                label.confidence <= previous + 1e-9,
                "confidence must not increase toward the boundary (step {step})"
            );
            previous = label.confidence;
        }
        // The midpoint itself is a transition point.
        assert!(previous < 0.05, "midpoint confidence should approach zero, got {previous}");
    }

    #[test]
    fn test_low_confidence_flag_respects_threshold() {
        let vectors = two_cluster_vectors();
        let model = RegimeDetector::default().fit(&vectors).unwrap();
        let c0 = model.centroid_raw(0).unwrap();
        let c1 = model.centroid_raw(1).unwrap();
        let mid: Vec<f64> = c0.iter().zip(&c1).map(|(a, b)| (a + b) / 2.0).collect();

        let boundary = synthetic_vector(0, mid[0], mid[1], mid[2]);
        let label = model.assign(&boundary).unwrap();
        assert!(label.is_low_confidence);

        let core = synthetic_vector(1, c0[0], c0[1], c0[2]);
        let label = model.assign(&core).unwrap();
        assert!(!label.is_low_confidence);
        assert!(label.confidence > 0.9);
    }

    #[test]
    fn test_missing_schema_feature_rejected() {
        let mut vectors = two_cluster_vectors();
        let detector = RegimeDetector::new(DetectorConfig {
            feature_names: vec![FeatureName::ResPenetration, FeatureName::LoadTightness],
            ..DetectorConfig::default()
        });
        vectors.truncate(40);
        let err = detector.fit(&vectors).unwrap_err();
        assert!(matches!(
            err,
            DetectorFitError::MissingFeature { feature: FeatureName::LoadTightness, .. }
        ));
    }

    #[test]
    fn test_fit_assign_labels_every_vector() {
        let vectors = two_cluster_vectors();
        let (model, labels) = RegimeDetector::default().fit_assign(&vectors).unwrap();
        assert_eq!(labels.len(), vectors.len());
        assert!(labels.iter().all(|l| l.regime_id < model.k));
        assert!(labels.iter().all(|l| (0.0..=1.0).contains(&l.confidence)));
    }

    #[test]
    fn test_training_ranges_cover_observations() {
        let vectors = two_cluster_vectors();
        let model = RegimeDetector::default().fit(&vectors).unwrap();
        let (lo, hi) = model.training_ranges[0];
        assert!(lo >= 0.19 && lo <= 0.21);
        assert!(hi >= 0.79 && hi <= 0.81);
    }
}
