//! Counterfactual Stress Testing
//!
//! Sweeps one feature of a baseline state vector across a value ladder,
//! re-assigning the regime and re-predicting price pressure at every step.
//! Surfaces regime boundary crossings (`regime_shifted`) and departures from
//! the training envelope (`extrapolated`).
//!
//! # Design Principles
//!
//! 1. **Fail before computing**: every feature name in a scenario is
//!    validated against the schema before any sweep step runs, so a typo
//!    can never produce partial output
//! 2. **Baseline is immutable**: each step perturbs a fresh copy; the
//!    caller's vector is never touched
//! 3. **Honest rows**: a step whose prediction comes out non-finite is
//!    reported with its `failure` message, never dropped from the table
//! 4. **Counterfactual, not forecast**: output is model response under a
//!    hypothetical state, with `extrapolated` marking where the model has
//!    no training support

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::detector::{AssignError, FittedClusterModel, RegimeLabel};
use crate::engine::ensemble::{ModelIdentity, PredictError, Prediction, RegimeModelEnsemble};
use crate::engine::state::{FeatureName, StateVector};

// =============================================================================
// SCENARIO DEFINITION
// =============================================================================

/// Inclusive value ladder for the swept feature. `start == end` means a
/// single step at that value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl SweepRange {
    /// Single-point sweep.
    pub fn fixed(value: f64) -> Self {
        Self { start: value, end: value, step: 0.0 }
    }

    fn validate(&self) -> Result<(), String> {
        if ![self.start, self.end, self.step].iter().all(|v| v.is_finite()) {
            return Err("sweep bounds must be finite".to_string());
        }
        if self.start == self.end {
            return Ok(());
        }
        if self.end < self.start {
            return Err(format!("sweep end {} below start {}", self.end, self.start));
        }
        if self.step <= 0.0 {
            return Err(format!("sweep step must be > 0, got {}", self.step));
        }
        Ok(())
    }

    fn ladder(&self) -> Vec<f64> {
        if self.start == self.end {
            return vec![self.start];
        }
        let mut values = Vec::new();
        let mut i = 0u32;
        loop {
            let v = self.start + f64::from(i) * self.step;
            if v > self.end + self.step * 1e-6 {
                break;
            }
            values.push(v.min(self.end));
            i += 1;
        }
        // A step that does not divide the range still ends on `end`: the
        // ladder is inclusive of both bounds.
        if let Some(&last) = values.last() {
            if last < self.end - self.step * 1e-6 {
                values.push(self.end);
            }
        }
        values
    }
}

/// A named counterfactual: fixed deltas applied once to the baseline, plus
/// one feature swept across a range of absolute values.
///
/// Feature names are strings at this boundary because scenarios typically
/// arrive from config or user input; they are parsed and validated before
/// any computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    pub description: String,
    pub baseline: StateVector,
    /// Additive shocks applied to the baseline before the sweep.
    pub fixed_deltas: BTreeMap<String, f64>,
    pub swept_feature: String,
    pub sweep: SweepRange,
}

impl StressScenario {
    /// RES penetration swept across its plausible range.
    pub fn renewable_surge(baseline: StateVector) -> Self {
        Self {
            name: "Renewable Surge".to_string(),
            description: "RES penetration rises to dominant share".to_string(),
            baseline,
            fixed_deltas: BTreeMap::new(),
            swept_feature: FeatureName::ResPenetration.as_str().to_string(),
            sweep: SweepRange { start: 0.10, end: 0.90, step: 0.05 },
        }
    }

    /// Net imports surge toward heavy dependency.
    pub fn import_crisis(baseline: StateVector) -> Self {
        Self {
            name: "Import Crisis".to_string(),
            description: "Net imports surge up to 1500 MW".to_string(),
            baseline,
            fixed_deltas: BTreeMap::new(),
            swept_feature: FeatureName::NetImport.as_str().to_string(),
            sweep: SweepRange { start: 0.0, end: 1500.0, step: 250.0 },
        }
    }

    /// Generation-mix volatility ramps up while the rest of the state holds.
    pub fn volatility_spike(baseline: StateVector) -> Self {
        Self {
            name: "Volatility Spike".to_string(),
            description: "Generation volatility ramps from calm to turbulent".to_string(),
            baseline,
            fixed_deltas: BTreeMap::new(),
            swept_feature: FeatureName::PriceVolatility.as_str().to_string(),
            sweep: SweepRange { start: 0.0, end: 150.0, step: 25.0 },
        }
    }

    /// RES drops and volatility jumps while import demand is swept up.
    pub fn perfect_storm(baseline: StateVector) -> Self {
        let mut fixed_deltas = BTreeMap::new();
        fixed_deltas.insert(FeatureName::ResPenetration.as_str().to_string(), -0.10);
        fixed_deltas.insert(FeatureName::PriceVolatility.as_str().to_string(), 30.0);
        Self {
            name: "Perfect Storm".to_string(),
            description: "RES drops, volatility jumps, import demand rises".to_string(),
            baseline,
            fixed_deltas,
            swept_feature: FeatureName::NetImport.as_str().to_string(),
            sweep: SweepRange { start: 0.0, end: 1200.0, step: 200.0 },
        }
    }

    /// All library presets anchored to one baseline.
    pub fn library(baseline: &StateVector) -> Vec<StressScenario> {
        vec![
            Self::renewable_surge(baseline.clone()),
            Self::import_crisis(baseline.clone()),
            Self::volatility_spike(baseline.clone()),
            Self::perfect_storm(baseline.clone()),
        ]
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// A scenario names a feature outside the schema. Raised before any sweep
/// step executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFeatureError {
    pub feature: String,
}

impl std::fmt::Display for UnknownFeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown feature '{}' in stress scenario", self.feature)
    }
}

impl std::error::Error for UnknownFeatureError {}

/// Fatal to one scenario run. No partial result is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StressError {
    UnknownFeature(UnknownFeatureError),
    /// A fixed delta targets a feature the baseline does not carry.
    MissingBaselineFeature { feature: FeatureName },
    InvalidSweep { reason: String },
    /// The unperturbed baseline itself fails regime assignment.
    BaselineAssign(AssignError),
    /// The unperturbed baseline itself fails prediction.
    BaselinePredict(PredictError),
}

impl std::fmt::Display for StressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFeature(e) => e.fmt(f),
            Self::MissingBaselineFeature { feature } => {
                write!(f, "baseline lacks feature {} targeted by a fixed delta", feature)
            }
            Self::InvalidSweep { reason } => write!(f, "invalid sweep range: {}", reason),
            Self::BaselineAssign(e) => write!(f, "baseline assignment failed: {}", e),
            Self::BaselinePredict(e) => write!(f, "baseline prediction failed: {}", e),
        }
    }
}

impl std::error::Error for StressError {}

impl From<UnknownFeatureError> for StressError {
    fn from(e: UnknownFeatureError) -> Self {
        Self::UnknownFeature(e)
    }
}

// =============================================================================
// RESULT ROWS
// =============================================================================

/// One row of the sweep table. `failure` rows keep their place in the
/// ladder with whatever was computed before the abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub swept_value: f64,
    pub regime_id: Option<usize>,
    pub confidence: Option<f64>,
    /// Landed in a different regime than the unperturbed baseline.
    pub regime_shifted: bool,
    /// At least one perturbed feature left its training range.
    pub extrapolated: bool,
    pub predicted_price_pressure: Option<f64>,
    pub model_used: Option<ModelIdentity>,
    pub failure: Option<String>,
}

/// Full outcome of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressRunResult {
    pub scenario_name: String,
    pub description: String,
    pub swept_feature: FeatureName,
    pub baseline_label: RegimeLabel,
    pub baseline_prediction: Prediction,
    pub points: Vec<SweepPoint>,
}

impl StressRunResult {
    /// Rows where the perturbation crossed a regime boundary.
    pub fn shift_points(&self) -> Vec<&SweepPoint> {
        self.points.iter().filter(|p| p.regime_shifted).collect()
    }

    /// Render the sweep as a fixed-width text table.
    pub fn format_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("=== STRESS SCENARIO: {} ===\n", self.scenario_name));
        out.push_str(&format!("{}\n", self.description));
        out.push_str(&format!(
            "Baseline: regime {} (confidence {:.3}), predicted pressure {:+.2}\n\n",
            self.baseline_label.regime_id,
            self.baseline_label.confidence,
            self.baseline_prediction.value
        ));
        out.push_str(&format!(
            "{:>12} | {:>6} | {:>6} | {:>5} | {:>6} | {:>10} | model\n",
            self.swept_feature.as_str(),
            "regime",
            "conf",
            "shift",
            "extrap",
            "pressure"
        ));
        out.push_str(&"-".repeat(68));
        out.push('\n');
        for p in &self.points {
            if let Some(failure) = &p.failure {
                out.push_str(&format!("{:>12.3} | FAILED: {}\n", p.swept_value, failure));
                continue;
            }
            let model = match p.model_used {
                Some(ModelIdentity::Regime(id)) => format!("regime-{id}"),
                Some(ModelIdentity::GlobalFallback) => "global".to_string(),
                None => "-".to_string(),
            };
            out.push_str(&format!(
                "{:>12.3} | {:>6} | {:>6.3} | {:>5} | {:>6} | {:>+10.2} | {}\n",
                p.swept_value,
                p.regime_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                p.confidence.unwrap_or(f64::NAN),
                if p.regime_shifted { "YES" } else { "" },
                if p.extrapolated { "YES" } else { "" },
                p.predicted_price_pressure.unwrap_or(f64::NAN),
                model
            ));
        }
        let shifts = self.shift_points().len();
        let failures = self.points.iter().filter(|p| p.failure.is_some()).count();
        out.push_str(&format!(
            "\n{} steps, {} regime shift(s), {} failure(s)\n",
            self.points.len(),
            shifts,
            failures
        ));
        out
    }
}

// =============================================================================
// TESTER
// =============================================================================

/// Runs scenarios against one fitted model generation. Borrows the
/// artifacts; never mutates them.
pub struct StressTester<'a> {
    cluster: &'a FittedClusterModel,
    ensemble: &'a RegimeModelEnsemble,
}

impl<'a> StressTester<'a> {
    pub fn new(cluster: &'a FittedClusterModel, ensemble: &'a RegimeModelEnsemble) -> Self {
        Self { cluster, ensemble }
    }

    /// Execute one scenario.
    ///
    /// Validation happens in full before the first sweep step: feature
    /// names must parse and appear in a model schema, fixed-delta targets
    /// must be present on the baseline, the sweep range must be coherent,
    /// and the unperturbed baseline must assign and predict cleanly.
    pub fn run(&self, scenario: &StressScenario) -> Result<StressRunResult, StressError> {
        let swept = self.resolve_feature(&scenario.swept_feature)?;
        let mut deltas: Vec<(FeatureName, f64)> = Vec::with_capacity(scenario.fixed_deltas.len());
        for (name, delta) in &scenario.fixed_deltas {
            deltas.push((self.resolve_feature(name)?, *delta));
        }
        scenario
            .sweep
            .validate()
            .map_err(|reason| StressError::InvalidSweep { reason })?;

        let baseline_label =
            self.cluster.assign(&scenario.baseline).map_err(StressError::BaselineAssign)?;
        let baseline_prediction = self
            .ensemble
            .predict(baseline_label.regime_id, &scenario.baseline)
            .map_err(StressError::BaselinePredict)?;

        // Fixed deltas are constant across the ladder; apply them once.
        let mut shocked = scenario.baseline.clone();
        for &(feature, delta) in &deltas {
            let current = shocked
                .feature(feature)
                .ok_or(StressError::MissingBaselineFeature { feature })?;
            shocked = shocked.with_feature(feature, current + delta);
        }

        let perturbed_features: Vec<FeatureName> =
            deltas.iter().map(|&(f, _)| f).chain(std::iter::once(swept)).collect();

        let points = scenario
            .sweep
            .ladder()
            .into_iter()
            .map(|value| {
                self.sweep_step(&shocked, swept, value, &perturbed_features, &baseline_label)
            })
            .collect::<Vec<_>>();

        info!(
            scenario = %scenario.name,
            steps = points.len(),
            shifts = points.iter().filter(|p| p.regime_shifted).count(),
            "stress scenario executed"
        );

        Ok(StressRunResult {
            scenario_name: scenario.name.clone(),
            description: scenario.description.clone(),
            swept_feature: swept,
            baseline_label,
            baseline_prediction,
            points,
        })
    }

    /// Run every library preset against one baseline.
    pub fn run_library(
        &self,
        baseline: &StateVector,
    ) -> Vec<(String, Result<StressRunResult, StressError>)> {
        StressScenario::library(baseline)
            .into_iter()
            .map(|scenario| {
                let name = scenario.name.clone();
                (name, self.run(&scenario))
            })
            .collect()
    }

    fn resolve_feature(&self, name: &str) -> Result<FeatureName, UnknownFeatureError> {
        let feature = FeatureName::parse(name)
            .ok_or_else(|| UnknownFeatureError { feature: name.to_string() })?;
        let in_schema = self.cluster.feature_names.contains(&feature)
            || self.ensemble.feature_names.contains(&feature);
        if !in_schema {
            return Err(UnknownFeatureError { feature: name.to_string() });
        }
        Ok(feature)
    }

    fn sweep_step(
        &self,
        shocked: &StateVector,
        swept: FeatureName,
        value: f64,
        perturbed_features: &[FeatureName],
        baseline_label: &RegimeLabel,
    ) -> SweepPoint {
        let point = shocked.with_feature(swept, value);
        let extrapolated = self.leaves_training_range(&point, perturbed_features);

        let label = match self.cluster.assign(&point) {
            Ok(label) => label,
            Err(e) => {
                debug!(swept_value = value, error = %e, "sweep step assignment failed");
                return SweepPoint {
                    swept_value: value,
                    regime_id: None,
                    confidence: None,
                    regime_shifted: false,
                    extrapolated,
                    predicted_price_pressure: None,
                    model_used: None,
                    failure: Some(e.to_string()),
                };
            }
        };

        let (prediction, model_used, failure) =
            match self.ensemble.predict(label.regime_id, &point) {
                Ok(p) => (Some(p.value), Some(p.model_used), None),
                Err(e) => {
                    debug!(swept_value = value, error = %e, "sweep step prediction failed");
                    (None, None, Some(e.to_string()))
                }
            };

        SweepPoint {
            swept_value: value,
            regime_id: Some(label.regime_id),
            confidence: Some(label.confidence),
            regime_shifted: label.regime_id != baseline_label.regime_id,
            extrapolated,
            predicted_price_pressure: prediction,
            model_used,
            failure,
        }
    }

    /// True when any perturbed feature of the point sits outside the raw
    /// (min, max) observed during clustering.
    fn leaves_training_range(&self, point: &StateVector, perturbed: &[FeatureName]) -> bool {
        perturbed.iter().any(|feature| {
            let Some(pos) =
                self.cluster.feature_names.iter().position(|f| f == feature)
            else {
                return false;
            };
            let Some(value) = point.feature(*feature) else {
                return false;
            };
            let (lo, hi) = self.cluster.training_ranges[pos];
            value < lo || value > hi
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::{DetectorConfig, RegimeDetector};
    use crate::engine::ensemble::{EnsembleConfig, LabeledObservation};
    use crate::engine::state::test_support::synthetic_vector;

    /// Two clusters at res 0.2 / 0.8. Net import and volatility share one
    /// distribution across both clusters, so the regime boundary sits on
    /// res_penetration alone and a res sweep crosses it near the midpoint.
    fn fitted_pair() -> (FittedClusterModel, RegimeModelEnsemble) {
        let mut vectors = Vec::new();
        for i in 0..50i64 {
            let net = (i as f64 - 24.5) * 4.0;
            let vol = 5.0 + ((i * 7) % 50) as f64 * 0.5;
            vectors.push(synthetic_vector(2 * i, 0.2 + (i % 5) as f64 * 0.004, net, vol));
            vectors.push(synthetic_vector(2 * i + 1, 0.8 - (i % 5) as f64 * 0.004, net, vol));
        }
        let detector = RegimeDetector::new(DetectorConfig {
            k_range: 2..=2,
            ..DetectorConfig::default()
        });
        let (cluster, labels) = detector.fit_assign(&vectors).unwrap();

        let rows: Vec<LabeledObservation> = vectors
            .iter()
            .zip(&labels)
            .map(|(state, label)| LabeledObservation {
                state: state.clone(),
                label: *label,
                target: 20.0 * state.res_penetration + 0.01 * state.net_import,
            })
            .collect();
        let ensemble = RegimeModelEnsemble::fit(
            &rows,
            &EnsembleConfig { min_samples_per_regime: 10, ..EnsembleConfig::default() },
        )
        .unwrap();
        (cluster, ensemble)
    }

    fn scenario(baseline: StateVector, sweep: SweepRange) -> StressScenario {
        StressScenario {
            name: "test".to_string(),
            description: "test sweep".to_string(),
            baseline,
            fixed_deltas: BTreeMap::new(),
            swept_feature: "res_penetration".to_string(),
            sweep,
        }
    }

    #[test]
    fn test_ladder_is_inclusive() {
        let range = SweepRange { start: 0.1, end: 0.9, step: 0.1 };
        let ladder = range.ladder();
        assert_eq!(ladder.len(), 9);
        assert!((ladder[0] - 0.1).abs() < 1e-12);
        assert!((ladder[8] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_range_is_single_step() {
        assert_eq!(SweepRange::fixed(0.4).ladder(), vec![0.4]);
    }

    #[test]
    fn test_ladder_ends_on_end_when_step_does_not_divide() {
        let ladder = SweepRange { start: 0.0, end: 0.25, step: 0.1 }.ladder();
        assert_eq!(ladder.len(), 4);
        assert!((ladder[2] - 0.2).abs() < 1e-12);
        assert!((ladder[3] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_feature_fails_before_any_computation() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let mut s = scenario(
            synthetic_vector(0, 0.2, 100.0, 10.0),
            SweepRange { start: 0.1, end: 0.9, step: 0.1 },
        );
        s.swept_feature = "res_penetation".to_string();
        let err = tester.run(&s).unwrap_err();
        assert_eq!(
            err,
            StressError::UnknownFeature(UnknownFeatureError {
                feature: "res_penetation".to_string()
            })
        );
    }

    #[test]
    fn test_sweep_crosses_regime_boundary_near_midpoint() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let baseline = synthetic_vector(0, 0.2, 100.0, 10.0);
        let result = tester
            .run(&scenario(baseline, SweepRange { start: 0.1, end: 0.9, step: 0.1 }))
            .unwrap();

        assert_eq!(result.points.len(), 9);
        assert!(!result.points[0].regime_shifted, "0.1 stays in the baseline regime");
        assert!(
            result.points[8].regime_shifted,
            "0.9 lands in the opposite regime"
        );
        // The crossing happens somewhere strictly between the extremes.
        let first_shift = result
            .points
            .iter()
            .position(|p| p.regime_shifted)
            .expect("a shift must occur");
        assert!(first_shift > 0 && first_shift < 8);
        let shift_value = result.points[first_shift].swept_value;
        assert!(
            (0.3..=0.7).contains(&shift_value),
            "boundary crossing at {shift_value} should be near the midpoint"
        );
    }

    #[test]
    fn test_zero_length_sweep_reproduces_baseline() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let baseline = synthetic_vector(0, 0.2, 100.0, 10.0);
        let result = tester
            .run(&scenario(baseline.clone(), SweepRange::fixed(baseline.res_penetration)))
            .unwrap();

        assert_eq!(result.points.len(), 1);
        let point = &result.points[0];
        assert_eq!(point.regime_id, Some(result.baseline_label.regime_id));
        assert_eq!(point.confidence, Some(result.baseline_label.confidence));
        assert!(!point.regime_shifted);
        assert!(!point.extrapolated);
        assert_eq!(
            point.predicted_price_pressure,
            Some(result.baseline_prediction.value)
        );
    }

    #[test]
    fn test_extrapolation_flagged_outside_training_range() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let baseline = synthetic_vector(0, 0.2, 100.0, 10.0);
        let result = tester
            .run(&scenario(baseline, SweepRange { start: 0.5, end: 2.0, step: 0.5 }))
            .unwrap();

        // res_penetration trained on roughly [0.18, 0.8]; 1.0+ is outside.
        assert!(!result.points[0].extrapolated, "0.5 is inside the envelope");
        assert!(result.points[2].extrapolated, "1.5 is outside");
        assert!(result.points[3].extrapolated, "2.0 is outside");
    }

    #[test]
    fn test_fixed_deltas_applied_before_sweep() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let baseline = synthetic_vector(0, 0.2, 100.0, 10.0);

        let mut with_delta = scenario(baseline.clone(), SweepRange::fixed(0.2));
        with_delta.fixed_deltas.insert("net_import".to_string(), -200.0);
        let shocked_run = tester.run(&with_delta).unwrap();

        let plain_run = tester.run(&scenario(baseline, SweepRange::fixed(0.2))).unwrap();
        // net_import carries a positive coefficient in the synthetic target.
        assert!(
            shocked_run.points[0].predicted_price_pressure.unwrap()
                < plain_run.points[0].predicted_price_pressure.unwrap()
        );
    }

    #[test]
    fn test_invalid_sweep_rejected() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let s = scenario(
            synthetic_vector(0, 0.2, 100.0, 10.0),
            SweepRange { start: 0.9, end: 0.1, step: 0.1 },
        );
        assert!(matches!(tester.run(&s).unwrap_err(), StressError::InvalidSweep { .. }));
    }

    #[test]
    fn test_library_presets_run() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let baseline = synthetic_vector(0, 0.4, 100.0, 10.0);
        let results = tester.run_library(&baseline);
        assert_eq!(results.len(), 4);
        for (name, result) in results {
            let result = result.unwrap_or_else(|e| panic!("{name} failed: {e}"));
            assert!(!result.points.is_empty());
        }
    }

    #[test]
    fn test_format_text_renders_table() {
        let (cluster, ensemble) = fitted_pair();
        let tester = StressTester::new(&cluster, &ensemble);
        let result = tester
            .run(&scenario(
                synthetic_vector(0, 0.2, 100.0, 10.0),
                SweepRange { start: 0.1, end: 0.9, step: 0.1 },
            ))
            .unwrap();
        let text = result.format_text();
        assert!(text.contains("STRESS SCENARIO"));
        assert!(text.contains("res_penetration"));
        assert!(text.contains("regime shift(s)"));
    }
}
