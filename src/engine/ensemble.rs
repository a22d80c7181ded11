//! Per-Regime Price-Pressure Models
//!
//! Fits one regularized linear model per regime mapping state vector →
//! price-pressure target, plus a global fallback model trained on the full
//! training split.
//!
//! # Design Principles
//!
//! 1. **No lookahead leakage**: rows are partitioned chronologically into
//!    train/validation/test *before* any fitting; validation and test are
//!    always strictly after train
//! 2. **Honest selection**: regularization strength is chosen on the
//!    validation split only — the test split never influences any fit
//! 3. **Explicit fallback**: a regime with too few training rows predicts
//!    with the global model's coefficients and is flagged `uses_fallback`,
//!    never silently fit on a handful of points
//! 4. **Honest metrics**: a regime with zero test rows reports `None`, not
//!    zero — zero would imply a measured score

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::detector::RegimeLabel;
use crate::engine::state::{FeatureName, StateVector};

const EPS: f64 = 1e-9;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Chronological split fractions. Validation and test rows are always
/// strictly after the training rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSplit {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for TimeSplit {
    fn default() -> Self {
        Self { train: 0.70, validation: 0.15, test: 0.15 }
    }
}

impl TimeSplit {
    fn validate(&self) -> Result<(), String> {
        let sum = self.train + self.validation + self.test;
        if !(self.train > 0.0 && self.validation >= 0.0 && self.test >= 0.0) {
            return Err("split fractions must be positive".to_string());
        }
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("split fractions must sum to 1.0, got {sum}"));
        }
        Ok(())
    }
}

/// Configuration for [`RegimeModelEnsemble::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub split: TimeSplit,
    /// Regimes with fewer training rows than this use the global model.
    pub min_samples_per_regime: usize,
    /// Ridge regularization candidates, searched on the validation split.
    pub alpha_grid: Vec<f64>,
    /// Features the models consume, in fixed order.
    pub feature_names: Vec<FeatureName>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            split: TimeSplit::default(),
            min_samples_per_regime: 30,
            alpha_grid: vec![0.01, 0.1, 1.0, 10.0, 100.0],
            feature_names: FeatureName::CORE.to_vec(),
        }
    }
}

// =============================================================================
// INPUT ROWS
// =============================================================================

/// One training/evaluation row: a labeled state vector and its observed
/// price-pressure target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledObservation {
    pub state: StateVector,
    pub label: RegimeLabel,
    pub target: f64,
}

// =============================================================================
// FITTED MODELS
// =============================================================================

/// A single ridge-regression model. Immutable once fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// One coefficient per schema feature, schema order.
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Regularization strength chosen on the validation split.
    pub alpha: f64,
    pub n_train: usize,
}

impl LinearModel {
    fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }
}

/// Per-regime entry of the ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeModel {
    pub regime_id: usize,
    pub model: LinearModel,
    /// True when this regime had fewer than `min_samples_per_regime`
    /// training rows and carries the global model's coefficients.
    pub uses_fallback: bool,
    /// Training rows observed for this regime (even when below threshold).
    pub n_regime_train: usize,
}

/// Which model produced a prediction, for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelIdentity {
    /// The regime's own dedicated model.
    Regime(usize),
    /// The global model, via fallback (sub-threshold or unknown regime).
    GlobalFallback,
}

/// A scalar prediction plus the identity of the model that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: f64,
    pub model_used: ModelIdentity,
}

/// Chronological split bookkeeping, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub n_train: usize,
    pub n_validation: usize,
    pub n_test: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
}

/// The fitted ensemble: a mapping from regime id to an independently fitted
/// linear model plus one global fallback. Immutable once fit; retraining
/// builds a new instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeModelEnsemble {
    pub feature_names: Vec<FeatureName>,
    pub models: BTreeMap<usize, RegimeModel>,
    pub global: LinearModel,
    pub split: SplitSummary,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal to a fit attempt. No ensemble is produced; any prior version
/// remains in use.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsembleFitError {
    /// The chronological train split came out empty.
    EmptyTrainSplit { n_rows: usize },
    /// A target value was NaN/Inf.
    NonFiniteTarget { timestamp: DateTime<Utc> },
    /// A row lacks a feature the configured schema requires.
    MissingFeature { feature: FeatureName, timestamp: DateTime<Utc> },
    InvalidConfig { reason: String },
}

impl std::fmt::Display for EnsembleFitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTrainSplit { n_rows } => {
                write!(f, "train split is empty ({} rows supplied)", n_rows)
            }
            Self::NonFiniteTarget { timestamp } => {
                write!(f, "non-finite target at {}", timestamp)
            }
            Self::MissingFeature { feature, timestamp } => {
                write!(f, "row at {} lacks feature {}", timestamp, feature)
            }
            Self::InvalidConfig { reason } => write!(f, "invalid ensemble config: {}", reason),
        }
    }
}

impl std::error::Error for EnsembleFitError {}

/// Failure to produce a single prediction. A non-finite result aborts the
/// row rather than propagating silently.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictError {
    MissingFeature { feature: FeatureName, timestamp: DateTime<Utc> },
    NonFinite { timestamp: DateTime<Utc> },
}

impl std::fmt::Display for PredictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFeature { feature, timestamp } => {
                write!(f, "vector at {} lacks feature {}", timestamp, feature)
            }
            Self::NonFinite { timestamp } => {
                write!(f, "non-finite prediction for vector at {}", timestamp)
            }
        }
    }
}

impl std::error::Error for PredictError {}

// =============================================================================
// FIT
// =============================================================================

impl RegimeModelEnsemble {
    /// Fit per-regime models and the global fallback.
    ///
    /// Rows are sorted by timestamp and split chronologically before any
    /// model fitting. Per regime, the ridge alpha is chosen by minimizing
    /// that regime's validation MSE over the candidate grid; the test split
    /// is never consulted. A regime with zero validation rows inherits the
    /// global model's chosen alpha.
    pub fn fit(
        rows: &[LabeledObservation],
        config: &EnsembleConfig,
    ) -> Result<RegimeModelEnsemble, EnsembleFitError> {
        config.split.validate().map_err(|reason| EnsembleFitError::InvalidConfig { reason })?;
        if config.alpha_grid.is_empty()
            || config.alpha_grid.iter().any(|a| !a.is_finite() || *a < 0.0)
        {
            return Err(EnsembleFitError::InvalidConfig {
                reason: "alpha_grid must be non-empty, finite, and non-negative".to_string(),
            });
        }

        for row in rows {
            if !row.target.is_finite() {
                return Err(EnsembleFitError::NonFiniteTarget { timestamp: row.state.timestamp });
            }
        }

        let mut sorted: Vec<&LabeledObservation> = rows.iter().collect();
        sorted.sort_by_key(|r| r.state.timestamp);

        let design: Vec<Vec<f64>> = sorted
            .iter()
            .map(|row| {
                config
                    .feature_names
                    .iter()
                    .map(|&name| {
                        row.state.feature(name).ok_or(EnsembleFitError::MissingFeature {
                            feature: name,
                            timestamp: row.state.timestamp,
                        })
                    })
                    .collect()
            })
            .collect::<Result<_, _>>()?;

        let n = sorted.len();
        let n_train = (n as f64 * config.split.train).floor() as usize;
        let n_validation = (n as f64 * config.split.validation).floor() as usize;
        if n_train == 0 {
            return Err(EnsembleFitError::EmptyTrainSplit { n_rows: n });
        }
        let val_end = n_train + n_validation;

        let train_idx: Vec<usize> = (0..n_train).collect();
        let val_idx: Vec<usize> = (n_train..val_end).collect();

        // Global model: full train split, alpha from full validation split.
        let global_alpha = choose_alpha(&design, &sorted, &train_idx, &val_idx, config, None);
        let global = ridge_fit(&design, &sorted, &train_idx, global_alpha);

        // Partition train/validation rows by regime label.
        let mut train_by_regime: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &i in &train_idx {
            train_by_regime.entry(sorted[i].label.regime_id).or_default().push(i);
        }
        let mut val_by_regime: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &i in &val_idx {
            val_by_regime.entry(sorted[i].label.regime_id).or_default().push(i);
        }

        let mut models = BTreeMap::new();
        for (&regime_id, regime_train) in &train_by_regime {
            let n_regime_train = regime_train.len();
            if n_regime_train < config.min_samples_per_regime {
                warn!(
                    regime_id,
                    n_regime_train,
                    threshold = config.min_samples_per_regime,
                    "regime below sample threshold, using global fallback"
                );
                models.insert(
                    regime_id,
                    RegimeModel {
                        regime_id,
                        model: global.clone(),
                        uses_fallback: true,
                        n_regime_train,
                    },
                );
                continue;
            }

            let regime_val = val_by_regime.get(&regime_id).cloned().unwrap_or_default();
            let alpha = choose_alpha(
                &design,
                &sorted,
                regime_train,
                &regime_val,
                config,
                Some(global_alpha),
            );
            let model = ridge_fit(&design, &sorted, regime_train, alpha);
            debug!(regime_id, alpha, n_regime_train, "regime model fitted");
            models.insert(
                regime_id,
                RegimeModel { regime_id, model, uses_fallback: false, n_regime_train },
            );
        }

        info!(
            regimes = models.len(),
            fallbacks = models.values().filter(|m| m.uses_fallback).count(),
            n_train,
            n_validation,
            n_test = n - val_end,
            "regime model ensemble fitted"
        );

        Ok(RegimeModelEnsemble {
            feature_names: config.feature_names.clone(),
            models,
            global,
            split: SplitSummary {
                n_train,
                n_validation,
                n_test: n - val_end,
                train_start: sorted[0].state.timestamp,
                train_end: sorted[n_train - 1].state.timestamp,
            },
        })
    }

    /// Predict price pressure for one state vector under a regime.
    ///
    /// Dispatches to the regime's dedicated model, or to the global model
    /// when the regime uses the fallback (or is unknown to this ensemble).
    pub fn predict(
        &self,
        regime_id: usize,
        vector: &StateVector,
    ) -> Result<Prediction, PredictError> {
        let features: Vec<f64> = self
            .feature_names
            .iter()
            .map(|&name| {
                vector.feature(name).ok_or(PredictError::MissingFeature {
                    feature: name,
                    timestamp: vector.timestamp,
                })
            })
            .collect::<Result<_, _>>()?;

        let (model, model_used) = match self.models.get(&regime_id) {
            Some(rm) if !rm.uses_fallback => (&rm.model, ModelIdentity::Regime(regime_id)),
            _ => (&self.global, ModelIdentity::GlobalFallback),
        };

        let value = model.predict(&features);
        if !value.is_finite() {
            return Err(PredictError::NonFinite { timestamp: vector.timestamp });
        }
        Ok(Prediction { value, model_used })
    }

    /// Compare coefficients across regimes, feature by feature. Fallback
    /// regimes are included; they carry the global coefficients.
    pub fn coefficient_comparison(&self) -> Vec<(FeatureName, BTreeMap<usize, f64>)> {
        self.feature_names
            .iter()
            .enumerate()
            .map(|(j, &feature)| {
                let per_regime = self
                    .models
                    .values()
                    .map(|rm| (rm.regime_id, rm.model.coefficients[j]))
                    .collect();
                (feature, per_regime)
            })
            .collect()
    }
}

/// Pick the alpha minimizing validation MSE; ties break toward the lowest
/// grid index. With no validation rows, use `inherit` (the global model's
/// choice) or, for the global model itself, the middle of the grid.
fn choose_alpha(
    design: &[Vec<f64>],
    rows: &[&LabeledObservation],
    train_idx: &[usize],
    val_idx: &[usize],
    config: &EnsembleConfig,
    inherit: Option<f64>,
) -> f64 {
    if val_idx.is_empty() {
        return inherit.unwrap_or(config.alpha_grid[config.alpha_grid.len() / 2]);
    }

    let scored: Vec<(usize, f64)> = config
        .alpha_grid
        .par_iter()
        .enumerate()
        .map(|(i, &alpha)| {
            let model = ridge_fit(design, rows, train_idx, alpha);
            let mse = val_idx
                .iter()
                .map(|&j| {
                    let err = model.predict(&design[j]) - rows[j].target;
                    err * err
                })
                .sum::<f64>()
                / val_idx.len() as f64;
            (i, mse)
        })
        .collect();

    let best = scored
        .into_iter()
        .min_by(|(ia, a), (ib, b)| {
            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal).then(ia.cmp(ib))
        })
        .map(|(i, _)| i)
        .expect("alpha_grid validated non-empty");
    config.alpha_grid[best]
}

/// Ridge regression via centered normal equations; the intercept is not
/// penalized. Solves (XcᵀXc + αI) w = Xcᵀ yc.
fn ridge_fit(
    design: &[Vec<f64>],
    rows: &[&LabeledObservation],
    idx: &[usize],
    alpha: f64,
) -> LinearModel {
    let d = design.first().map(|r| r.len()).unwrap_or(0);
    let n = idx.len();

    let mut x_mean = vec![0.0; d];
    let mut y_mean = 0.0;
    for &i in idx {
        for (m, x) in x_mean.iter_mut().zip(&design[i]) {
            *m += x;
        }
        y_mean += rows[i].target;
    }
    for m in &mut x_mean {
        *m /= n as f64;
    }
    y_mean /= n as f64;

    let xc = DMatrix::from_fn(n, d, |r, c| design[idx[r]][c] - x_mean[c]);
    let yc = DVector::from_fn(n, |r, _| rows[idx[r]].target - y_mean);

    let mut gram = xc.transpose() * &xc;
    for j in 0..d {
        gram[(j, j)] += alpha;
    }
    let rhs = xc.transpose() * yc;

    let w = gram
        .clone()
        .cholesky()
        .map(|ch| ch.solve(&rhs))
        .or_else(|| gram.lu().solve(&rhs))
        .unwrap_or_else(|| DVector::zeros(d));

    let coefficients: Vec<f64> = w.iter().copied().collect();
    let intercept = y_mean
        - coefficients
            .iter()
            .zip(&x_mean)
            .map(|(c, m)| c * m)
            .sum::<f64>();

    LinearModel { coefficients, intercept, alpha, n_train: n }
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Goodness-of-fit metrics for one regime or the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub r2: f64,
    pub mae: f64,
    pub rmse: f64,
    pub n_samples: usize,
}

fn regression_metrics(pairs: &[(f64, f64)]) -> RegressionMetrics {
    let n = pairs.len() as f64;
    let mean_actual = pairs.iter().map(|(y, _)| y).sum::<f64>() / n;
    let ss_res: f64 = pairs.iter().map(|(y, p)| (y - p) * (y - p)).sum();
    let ss_tot: f64 = pairs.iter().map(|(y, _)| (y - mean_actual) * (y - mean_actual)).sum();
    let r2 = if ss_tot <= EPS {
        if ss_res <= EPS { 1.0 } else { 0.0 }
    } else {
        1.0 - ss_res / ss_tot
    };
    RegressionMetrics {
        r2,
        mae: pairs.iter().map(|(y, p)| (y - p).abs()).sum::<f64>() / n,
        rmse: (ss_res / n).sqrt(),
        n_samples: pairs.len(),
    }
}

/// Per-regime and aggregate evaluation over a held-out test set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// `None` for a regime with zero test rows — never a zero-valued score.
    pub per_regime: BTreeMap<usize, Option<RegressionMetrics>>,
    /// `None` when the test set is empty.
    pub overall: Option<RegressionMetrics>,
    /// Rows whose prediction aborted (non-finite); reported, not omitted.
    pub failed_rows: usize,
}

impl RegimeModelEnsemble {
    /// Evaluate against labeled test rows.
    pub fn evaluate(&self, test_rows: &[LabeledObservation]) -> EvaluationReport {
        let mut by_regime: BTreeMap<usize, Vec<(f64, f64)>> = BTreeMap::new();
        let mut all_pairs: Vec<(f64, f64)> = Vec::with_capacity(test_rows.len());
        let mut failed_rows = 0usize;

        let known: BTreeSet<usize> = self.models.keys().copied().collect();
        for row in test_rows {
            match self.predict(row.label.regime_id, &row.state) {
                Ok(pred) => {
                    by_regime
                        .entry(row.label.regime_id)
                        .or_default()
                        .push((row.target, pred.value));
                    all_pairs.push((row.target, pred.value));
                }
                Err(e) => {
                    warn!(error = %e, "evaluation row aborted");
                    failed_rows += 1;
                }
            }
        }

        let regime_ids: BTreeSet<usize> =
            known.union(&by_regime.keys().copied().collect()).copied().collect();
        let per_regime = regime_ids
            .into_iter()
            .map(|id| {
                let metrics = by_regime
                    .get(&id)
                    .filter(|pairs| !pairs.is_empty())
                    .map(|pairs| regression_metrics(pairs));
                (id, metrics)
            })
            .collect();

        let overall =
            if all_pairs.is_empty() { None } else { Some(regression_metrics(&all_pairs)) };

        EvaluationReport { per_regime, overall, failed_rows }
    }

    /// Human-readable ensemble summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("=== REGIME MODEL ENSEMBLE ===\n");
        out.push_str(&format!(
            "Train rows: {} | Validation rows: {} | Test rows: {}\n",
            self.split.n_train, self.split.n_validation, self.split.n_test
        ));
        out.push_str(&format!(
            "Training window: {} .. {}\n\n",
            self.split.train_start, self.split.train_end
        ));
        for rm in self.models.values() {
            out.push_str(&format!(
                "Regime {} | alpha {:.3} | train rows {}{}\n",
                rm.regime_id,
                rm.model.alpha,
                rm.n_regime_train,
                if rm.uses_fallback { " | FALLBACK (global coefficients)" } else { "" }
            ));
            out.push_str(&format!("  intercept: {:+.4}\n", rm.model.intercept));
            for (feature, coef) in self.feature_names.iter().zip(&rm.model.coefficients) {
                out.push_str(&format!("  {:.<28} {:+.4}\n", feature.as_str(), coef));
            }
        }
        out.push_str(&format!(
            "Global | alpha {:.3} | train rows {}\n",
            self.global.alpha, self.global.n_train
        ));
        out
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_support::synthetic_vector;

    /// Rows with a known linear target inside each regime:
    /// regime 0: y = 10 + 5·res, regime 1: y = -3 + 2·res.
    fn synthetic_rows(n_per_regime: usize) -> Vec<LabeledObservation> {
        let mut rows = Vec::new();
        for i in 0..n_per_regime {
            let res = 0.1 + (i % 20) as f64 * 0.01;
            rows.push(LabeledObservation {
                state: synthetic_vector(2 * i as i64, res, 50.0, 5.0),
                label: RegimeLabel { regime_id: 0, confidence: 0.9, is_low_confidence: false },
                target: 10.0 + 5.0 * res,
            });
            let res1 = 0.6 + (i % 20) as f64 * 0.01;
            rows.push(LabeledObservation {
                state: synthetic_vector(2 * i as i64 + 1, res1, -50.0, 5.0),
                label: RegimeLabel { regime_id: 1, confidence: 0.9, is_low_confidence: false },
                target: -3.0 + 2.0 * res1,
            });
        }
        rows
    }

    fn small_config() -> EnsembleConfig {
        EnsembleConfig { min_samples_per_regime: 10, ..EnsembleConfig::default() }
    }

    #[test]
    fn test_fit_recovers_per_regime_slopes() {
        let rows = synthetic_rows(60);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();

        let m0 = &ensemble.models[&0];
        let m1 = &ensemble.models[&1];
        assert!(!m0.uses_fallback);
        assert!(!m1.uses_fallback);
        // res_penetration is coefficient 0; noiseless targets, small alpha.
        assert!((m0.model.coefficients[0] - 5.0).abs() < 0.5, "got {}", m0.model.coefficients[0]);
        assert!((m1.model.coefficients[0] - 2.0).abs() < 0.5, "got {}", m1.model.coefficients[0]);
    }

    #[test]
    fn test_split_is_chronological() {
        let rows = synthetic_rows(50);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();
        assert_eq!(ensemble.split.n_train, 70);
        assert_eq!(ensemble.split.n_validation, 15);
        assert_eq!(ensemble.split.n_test, 15);
        assert!(ensemble.split.train_start < ensemble.split.train_end);
    }

    #[test]
    fn test_sub_threshold_regime_uses_global_fallback() {
        let mut rows = synthetic_rows(60);
        // Regime 7 appears in only three early rows.
        for row in rows.iter_mut().take(3) {
            row.label.regime_id = 7;
        }
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();

        let m7 = &ensemble.models[&7];
        assert!(m7.uses_fallback);
        assert_eq!(m7.n_regime_train, 3);
        assert_eq!(m7.model.coefficients, ensemble.global.coefficients);

        // Fallback prediction is exactly the global model's prediction.
        let probe = synthetic_vector(500, 0.4, 10.0, 5.0);
        let via_regime = ensemble.predict(7, &probe).unwrap();
        assert_eq!(via_regime.model_used, ModelIdentity::GlobalFallback);
        let global_value = ensemble.global.predict(
            &probe.features(&ensemble.feature_names).unwrap(),
        );
        assert_eq!(via_regime.value, global_value);
    }

    #[test]
    fn test_unknown_regime_dispatches_to_global() {
        let rows = synthetic_rows(50);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();
        let probe = synthetic_vector(500, 0.4, 10.0, 5.0);
        let pred = ensemble.predict(99, &probe).unwrap();
        assert_eq!(pred.model_used, ModelIdentity::GlobalFallback);
    }

    #[test]
    fn test_test_split_never_influences_coefficients() {
        let rows = synthetic_rows(60);
        let config = small_config();
        let baseline = RegimeModelEnsemble::fit(&rows, &config).unwrap();

        // Perturb only test-split targets (chronologically last 15%).
        let mut sorted = rows.clone();
        sorted.sort_by_key(|r| r.state.timestamp);
        let n = sorted.len();
        let test_start = n - (n as f64 * config.split.test).floor() as usize;
        let cutoff = sorted[test_start].state.timestamp;

        let perturbed_rows: Vec<LabeledObservation> = rows
            .iter()
            .map(|r| {
                let mut r = r.clone();
                if r.state.timestamp >= cutoff {
                    r.target += 1000.0;
                }
                r
            })
            .collect();
        let perturbed = RegimeModelEnsemble::fit(&perturbed_rows, &config).unwrap();

        assert_eq!(baseline.global.coefficients, perturbed.global.coefficients);
        assert_eq!(baseline.global.alpha, perturbed.global.alpha);
        for (id, rm) in &baseline.models {
            assert_eq!(rm.model.coefficients, perturbed.models[id].model.coefficients);
            assert_eq!(rm.model.alpha, perturbed.models[id].model.alpha);
        }
    }

    #[test]
    fn test_non_finite_target_rejected() {
        let mut rows = synthetic_rows(30);
        rows[10].target = f64::NAN;
        let err = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap_err();
        assert!(matches!(err, EnsembleFitError::NonFiniteTarget { .. }));
    }

    #[test]
    fn test_empty_rows_rejected() {
        let err = RegimeModelEnsemble::fit(&[], &small_config()).unwrap_err();
        assert!(matches!(err, EnsembleFitError::EmptyTrainSplit { n_rows: 0 }));
    }

    #[test]
    fn test_evaluate_reports_none_for_empty_regime() {
        let rows = synthetic_rows(60);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();

        // Test rows cover regime 0 only; regime 1 must report None.
        let test_rows: Vec<LabeledObservation> = rows
            .iter()
            .filter(|r| r.label.regime_id == 0)
            .take(10)
            .cloned()
            .collect();
        let report = ensemble.evaluate(&test_rows);

        assert!(report.per_regime[&0].is_some());
        assert_eq!(report.per_regime[&1], None);
        let overall = report.overall.unwrap();
        assert_eq!(overall.n_samples, 10);
        // Fit on the chronological train split only; ridge shrinkage leaves
        // a small residual against rows drawn from the full period.
        assert!(overall.r2 > 0.95, "noiseless linear data should fit, r2={}", overall.r2);
        assert_eq!(report.failed_rows, 0);
    }

    #[test]
    fn test_coefficient_comparison_shape() {
        let rows = synthetic_rows(50);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();
        let comparison = ensemble.coefficient_comparison();
        assert_eq!(comparison.len(), ensemble.feature_names.len());
        assert_eq!(comparison[0].0, FeatureName::ResPenetration);
        assert!(comparison[0].1.contains_key(&0) && comparison[0].1.contains_key(&1));
    }

    #[test]
    fn test_summary_renders() {
        let rows = synthetic_rows(40);
        let ensemble = RegimeModelEnsemble::fit(&rows, &small_config()).unwrap();
        let text = ensemble.summary();
        assert!(text.contains("REGIME MODEL ENSEMBLE"));
        assert!(text.contains("res_penetration"));
    }
}
