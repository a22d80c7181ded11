//! GridRegime Library
//!
//! Regime detection and counterfactual stress testing for electricity
//! market zones. See [`engine`] for the pipeline architecture.

pub mod engine;

// Re-export the public surface at the crate root.
pub use engine::artifact::{ModelVersion, VersionFitError};
pub use engine::detector::{
    AssignError, DetectorConfig, DetectorFitError, FittedClusterModel, InsufficientDataError,
    RegimeDetector, RegimeLabel,
};
pub use engine::ensemble::{
    EnsembleConfig, EnsembleFitError, EvaluationReport, LabeledObservation, LinearModel,
    ModelIdentity, PredictError, Prediction, RegimeModel, RegimeModelEnsemble, RegressionMetrics,
    SplitSummary, TimeSplit,
};
pub use engine::naming::{derive_regime_names, NamingRules};
pub use engine::state::{
    cross_border, BuilderConfig, CrossBorderRow, DataGapError, FeatureName, GapCauses,
    HourlyObservation, StateVector, StateVectorBatch, StateVectorBuilder,
};
pub use engine::stress::{
    StressError, StressRunResult, StressScenario, StressTester, SweepPoint, SweepRange,
    UnknownFeatureError,
};
