//! State Vector Construction
//!
//! Converts raw per-zone hourly generation/load/flow observations into
//! fixed-width numeric state vectors, one per (zone, hour).
//!
//! # Design Principles
//!
//! 1. **No imputation**: hours with incomplete generation data are dropped,
//!    never zero-filled — a fabricated row would inject false regime signal
//! 2. **Explainable gaps**: every dropped hour is accounted for in a
//!    [`DataGapError`] so callers can decide whether coverage is sufficient
//! 3. **Pure**: building state vectors is a pure function of the input rows

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

// =============================================================================
// FEATURE SCHEMA
// =============================================================================

/// The closed set of state-vector features, in canonical order.
///
/// The first three are always present on a built vector; the last two are
/// optional and require zone capacity / interconnector limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    /// Renewable MW / total generation MW, in [0, 1].
    ResPenetration,
    /// Signed cross-border flow in MW, imports positive.
    NetImport,
    /// Rolling std dev of the reference price proxy over the trailing window.
    PriceVolatility,
    /// Load / available zone capacity.
    LoadTightness,
    /// |flow| / interconnector limit, in [0, 1].
    InterconnectSaturation,
}

impl FeatureName {
    /// The three features every built state vector carries.
    pub const CORE: [FeatureName; 3] = [
        FeatureName::ResPenetration,
        FeatureName::NetImport,
        FeatureName::PriceVolatility,
    ];

    /// All schema features in canonical order.
    pub const ALL: [FeatureName; 5] = [
        FeatureName::ResPenetration,
        FeatureName::NetImport,
        FeatureName::PriceVolatility,
        FeatureName::LoadTightness,
        FeatureName::InterconnectSaturation,
    ];

    /// Canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResPenetration => "res_penetration",
            Self::NetImport => "net_import",
            Self::PriceVolatility => "price_volatility",
            Self::LoadTightness => "load_tightness",
            Self::InterconnectSaturation => "interconnect_saturation",
        }
    }

    /// Parse a feature name. `None` for anything outside the schema.
    pub fn parse(name: &str) -> Option<FeatureName> {
        Self::ALL.iter().copied().find(|f| f.as_str() == name)
    }
}

impl std::fmt::Display for FeatureName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// STATE VECTOR
// =============================================================================

/// Compact numeric description of a market zone for one hour.
///
/// Invariant: every present field is finite. Hours whose source rows cannot
/// produce a finite, complete vector are dropped by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub timestamp: DateTime<Utc>,
    pub zone: String,
    pub res_penetration: f64,
    pub net_import: f64,
    pub price_volatility: f64,
    pub load_tightness: Option<f64>,
    pub interconnect_saturation: Option<f64>,
}

impl StateVector {
    /// Value of a single schema feature, `None` when the optional feature
    /// was not computed for this vector.
    pub fn feature(&self, name: FeatureName) -> Option<f64> {
        match name {
            FeatureName::ResPenetration => Some(self.res_penetration),
            FeatureName::NetImport => Some(self.net_import),
            FeatureName::PriceVolatility => Some(self.price_volatility),
            FeatureName::LoadTightness => self.load_tightness,
            FeatureName::InterconnectSaturation => self.interconnect_saturation,
        }
    }

    /// Extract the listed features in order; `None` if any is absent.
    pub fn features(&self, names: &[FeatureName]) -> Option<Vec<f64>> {
        names.iter().map(|&n| self.feature(n)).collect()
    }

    /// Copy of this vector with one feature replaced. Used by the stress
    /// tester; the original is never mutated.
    pub fn with_feature(&self, name: FeatureName, value: f64) -> StateVector {
        let mut out = self.clone();
        match name {
            FeatureName::ResPenetration => out.res_penetration = value,
            FeatureName::NetImport => out.net_import = value,
            FeatureName::PriceVolatility => out.price_volatility = value,
            FeatureName::LoadTightness => out.load_tightness = Some(value),
            FeatureName::InterconnectSaturation => out.interconnect_saturation = Some(value),
        }
        out
    }
}

// =============================================================================
// INPUT ROWS
// =============================================================================

/// One raw hour of upstream data for a zone, as supplied by the ingestion
/// layer. Zone identifiers are opaque strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyObservation {
    pub timestamp: DateTime<Utc>,
    pub zone: String,
    /// Generation by PSR type, MW.
    pub generation_mw: BTreeMap<String, f64>,
    /// Zone load, MW. Only needed for the optional `load_tightness` feature.
    pub load_mw: Option<f64>,
    /// Signed cross-border flow, MW, imports positive.
    pub net_flow_mw: Option<f64>,
}

// =============================================================================
// DATA GAPS
// =============================================================================

/// Per-cause breakdown of skipped hours within one gap range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapCauses {
    /// At least one expected PSR type reading was missing.
    pub missing_psr: usize,
    /// No cross-border flow reading.
    pub missing_flow: usize,
    /// Inside the volatility warm-up window (first W complete hours).
    pub volatility_warmup: usize,
    /// A source value was NaN/Inf or total generation was non-positive.
    pub non_finite: usize,
}

impl GapCauses {
    pub fn total(&self) -> usize {
        self.missing_psr + self.missing_flow + self.volatility_warmup + self.non_finite
    }
}

/// Recoverable report of a contiguous range of hours that produced no
/// state vector. Callers decide whether coverage is sufficient to proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGapError {
    pub zone: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub skipped_hours: usize,
    pub causes: GapCauses,
}

impl std::fmt::Display for DataGapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data gap in zone {}: {} hour(s) skipped between {} and {} \
             (missing_psr={}, missing_flow={}, warmup={}, non_finite={})",
            self.zone,
            self.skipped_hours,
            self.range_start,
            self.range_end,
            self.causes.missing_psr,
            self.causes.missing_flow,
            self.causes.volatility_warmup,
            self.causes.non_finite,
        )
    }
}

impl std::error::Error for DataGapError {}

// =============================================================================
// BUILDER
// =============================================================================

/// Configuration for [`StateVectorBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// PSR types an hour must carry to count as complete. Empty set means
    /// "any non-empty generation map is complete".
    pub expected_psr_types: BTreeSet<String>,
    /// PSR types counted as renewable for `res_penetration`.
    pub renewable_psr_types: BTreeSet<String>,
    /// Trailing window W for `price_volatility` (hours). The first W
    /// complete hours of a dataset cannot produce a vector.
    pub volatility_window: usize,
    /// Zone capacity in MW; enables the `load_tightness` feature.
    pub zone_capacity_mw: Option<f64>,
    /// Interconnector limit in MW; enables `interconnect_saturation`.
    pub interconnector_limit_mw: Option<f64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        // ENTSO-E PSR codes: wind/solar/hydro run-of-river are renewable.
        let renewable = ["B09", "B11", "B12", "B16", "B18", "B19"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            expected_psr_types: BTreeSet::new(),
            renewable_psr_types: renewable,
            volatility_window: 24,
            zone_capacity_mw: None,
            interconnector_limit_mw: None,
        }
    }
}

/// Output of one build call: the vectors that could be produced plus a gap
/// report for every contiguous range of hours that could not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVectorBatch {
    pub zone: String,
    pub vectors: Vec<StateVector>,
    pub gaps: Vec<DataGapError>,
}

impl StateVectorBatch {
    pub fn skipped_hours(&self) -> usize {
        self.gaps.iter().map(|g| g.skipped_hours).sum()
    }
}

/// Why a single hour was dropped. Internal to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropCause {
    MissingPsr,
    MissingFlow,
    VolatilityWarmup,
    NonFinite,
}

/// Builds state vectors from raw hourly observations. Pure; holds only
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct StateVectorBuilder {
    config: BuilderConfig,
}

impl StateVectorBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build one state vector per complete hour for `zone`.
    ///
    /// Rows for other zones are ignored. Duplicate timestamps keep the last
    /// row. Hours are processed in chronological order regardless of input
    /// order; the trailing volatility window is computed over the previous
    /// W complete hours' reference price proxy (total generation MW).
    pub fn build(&self, zone: &str, rows: &[HourlyObservation]) -> StateVectorBatch {
        let mut by_hour: BTreeMap<DateTime<Utc>, &HourlyObservation> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.zone == zone) {
            by_hour.insert(row.timestamp, row);
        }

        let mut vectors = Vec::with_capacity(by_hour.len());
        let mut gaps: Vec<DataGapError> = Vec::new();
        let mut open_gap: Option<DataGapError> = None;
        // Reference price proxy history over complete hours only.
        let mut proxy_history: Vec<f64> = Vec::new();

        for (&ts, row) in &by_hour {
            match self.build_hour(ts, row, &mut proxy_history) {
                Ok(vector) => {
                    if let Some(gap) = open_gap.take() {
                        gaps.push(gap);
                    }
                    vectors.push(vector);
                }
                Err(cause) => record_skip(&mut open_gap, zone, ts, cause),
            }
        }
        if let Some(gap) = open_gap.take() {
            gaps.push(gap);
        }

        if !gaps.is_empty() {
            tracing::debug!(
                zone,
                skipped = gaps.iter().map(|g| g.skipped_hours).sum::<usize>(),
                ranges = gaps.len(),
                "state vector build skipped hours"
            );
        }

        StateVectorBatch { zone: zone.to_string(), vectors, gaps }
    }

    /// Attempt one hour. On success the hour's proxy is appended to the
    /// history; incomplete hours never contribute to the proxy.
    fn build_hour(
        &self,
        ts: DateTime<Utc>,
        row: &HourlyObservation,
        proxy_history: &mut Vec<f64>,
    ) -> Result<StateVector, DropCause> {
        let cfg = &self.config;

        if row.generation_mw.is_empty() {
            return Err(DropCause::MissingPsr);
        }
        if !cfg.expected_psr_types.is_empty()
            && !cfg.expected_psr_types.iter().all(|t| row.generation_mw.contains_key(t))
        {
            return Err(DropCause::MissingPsr);
        }
        if row.generation_mw.values().any(|v| !v.is_finite()) {
            return Err(DropCause::NonFinite);
        }

        let total_mw: f64 = row.generation_mw.values().sum();
        if !(total_mw > 0.0) {
            return Err(DropCause::NonFinite);
        }

        let net_import = match row.net_flow_mw {
            Some(flow) if flow.is_finite() => flow,
            Some(_) => return Err(DropCause::NonFinite),
            None => return Err(DropCause::MissingFlow),
        };

        let renewable_mw: f64 = row
            .generation_mw
            .iter()
            .filter(|(psr, _)| cfg.renewable_psr_types.contains(*psr))
            .map(|(_, mw)| mw)
            .sum();
        let res_penetration = (renewable_mw / total_mw).clamp(0.0, 1.0);

        // The hour is complete: it contributes to the proxy history whether
        // or not it survives the warm-up cut.
        let window = cfg.volatility_window;
        let warm = proxy_history.len() >= window;
        let price_volatility = if warm {
            let tail = &proxy_history[proxy_history.len() - window..];
            tail.iter().std_dev()
        } else {
            f64::NAN
        };
        proxy_history.push(total_mw);
        if !warm {
            return Err(DropCause::VolatilityWarmup);
        }
        if !price_volatility.is_finite() {
            return Err(DropCause::NonFinite);
        }

        let load_tightness = match (cfg.zone_capacity_mw, row.load_mw) {
            (Some(cap), Some(load)) if cap > 0.0 && load.is_finite() => Some(load / cap),
            _ => None,
        };
        let interconnect_saturation = cfg
            .interconnector_limit_mw
            .filter(|&limit| limit > 0.0)
            .map(|limit| (net_import.abs() / limit).clamp(0.0, 1.0));

        Ok(StateVector {
            timestamp: ts,
            zone: row.zone.clone(),
            res_penetration,
            net_import,
            price_volatility,
            load_tightness,
            interconnect_saturation,
        })
    }
}

/// Extend the open gap (or open a new one) with a skipped hour.
fn record_skip(
    open_gap: &mut Option<DataGapError>,
    zone: &str,
    ts: DateTime<Utc>,
    cause: DropCause,
) {
    let gap = open_gap.get_or_insert_with(|| DataGapError {
        zone: zone.to_string(),
        range_start: ts,
        range_end: ts,
        skipped_hours: 0,
        causes: GapCauses::default(),
    });
    // Non-adjacent hours still extend the same open gap: no vector was
    // produced anywhere in between, so the range stays contiguous in output.
    gap.range_end = ts;
    gap.skipped_hours += 1;
    match cause {
        DropCause::MissingPsr => gap.causes.missing_psr += 1,
        DropCause::MissingFlow => gap.causes.missing_flow += 1,
        DropCause::VolatilityWarmup => gap.causes.volatility_warmup += 1,
        DropCause::NonFinite => gap.causes.non_finite += 1,
    }
}

// =============================================================================
// CROSS-BORDER DIVERGENCE
// =============================================================================

/// Per-hour divergence between two zones' state vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossBorderRow {
    pub timestamp: DateTime<Utc>,
    pub zone_pair: String,
    /// res_penetration(a) - res_penetration(b).
    pub res_asymmetry: f64,
    /// load_tightness(a) - load_tightness(b), when both sides carry it.
    pub tightness_diff: Option<f64>,
    /// |price_volatility(a) - price_volatility(b)|.
    pub volatility_spread: f64,
}

/// Join two zones' batches on timestamp and compute divergence rows.
/// Hours present on only one side are silently absent from the output;
/// their gaps are already reported on the owning batch.
pub fn cross_border(a: &StateVectorBatch, b: &StateVectorBatch) -> Vec<CrossBorderRow> {
    let by_ts: BTreeMap<DateTime<Utc>, &StateVector> =
        b.vectors.iter().map(|v| (v.timestamp, v)).collect();
    let pair = format!("{}-{}", a.zone, b.zone);

    a.vectors
        .iter()
        .filter_map(|va| {
            by_ts.get(&va.timestamp).map(|vb| CrossBorderRow {
                timestamp: va.timestamp,
                zone_pair: pair.clone(),
                res_asymmetry: va.res_penetration - vb.res_penetration,
                tightness_diff: match (va.load_tightness, vb.load_tightness) {
                    (Some(ta), Some(tb)) => Some(ta - tb),
                    _ => None,
                },
                volatility_spread: (va.price_volatility - vb.price_volatility).abs(),
            })
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================
