//! Regime Detection & Counterfactual Stress-Testing Engine
//!
//! Discovers operating regimes of an electricity zone from hourly system
//! state, fits a price-pressure model per regime, and answers "what if"
//! questions by sweeping counterfactual states through the fitted models.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StateVectorBuilder                       │
//! │  (hourly observations → validated feature vectors + gaps)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RegimeDetector                          │
//! │  (k-means++ over standardized features, k by separation)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ labels
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RegimeModelEnsemble                       │
//! │  (one ridge model per regime + global fallback,             │
//! │   chronological train/validation/test split)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │       StressTester        │  │       ModelVersion        │
//! │  (counterfactual sweeps,  │  │  (versioned artifact,     │
//! │   shift/extrapolation)    │  │   JSON persistence)       │
//! └───────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - **RNG**: seeded `ChaCha8Rng` only; same seed and input, same fit
//! - **Parallelism**: rayon trials write private slots; winner selection
//!   uses explicit tie-break keys, independent of execution order
//! - **Artifacts**: fitted models are immutable; retraining produces a
//!   new `ModelVersion`, never an in-place update

pub mod artifact;
pub mod detector;
pub mod ensemble;
pub mod naming;
pub mod state;
pub mod stress;
