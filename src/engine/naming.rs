//! Semantic Regime Naming
//!
//! Maps numeric regime ids to human-readable labels by ranking the
//! de-standardized centroids on renewable penetration. Names are pure
//! metadata for reports; assignment and prediction never read them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::detector::FittedClusterModel;
use crate::engine::state::FeatureName;

/// Label vocabulary. The lowest-RES centroid takes `low`, the highest
/// takes `high`, anything between takes `mid_prefix` plus its rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingRules {
    pub low: String,
    pub high: String,
    pub mid_prefix: String,
}

impl Default for NamingRules {
    fn default() -> Self {
        Self {
            low: "Fossil-Heavy".to_string(),
            high: "RES-Dominant".to_string(),
            mid_prefix: "Mixed".to_string(),
        }
    }
}

/// Derive display names for every regime of a fitted cluster model.
///
/// Centroids are ranked by raw-unit `res_penetration` ascending. With a
/// single regime the `high` label applies. When the model was fit without
/// `res_penetration` in its schema, regimes fall back to numbered labels.
pub fn derive_regime_names(
    model: &FittedClusterModel,
    rules: &NamingRules,
) -> BTreeMap<usize, String> {
    let res_pos = model
        .feature_names
        .iter()
        .position(|&f| f == FeatureName::ResPenetration);

    let Some(res_pos) = res_pos else {
        return (0..model.k)
            .map(|id| (id, format!("{}-{}", rules.mid_prefix, id + 1)))
            .collect();
    };

    let mut ranked: Vec<(usize, f64)> = (0..model.k)
        .filter_map(|id| model.centroid_raw(id).map(|c| (id, c[res_pos])))
        .collect();
    ranked.sort_by(|a, b| {
        a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
    });

    let last = ranked.len().saturating_sub(1);
    ranked
        .iter()
        .enumerate()
        .map(|(rank, &(id, _))| {
            let name = if rank == last {
                rules.high.clone()
            } else if rank == 0 {
                rules.low.clone()
            } else {
                format!("{}-{}", rules.mid_prefix, rank)
            };
            (id, name)
        })
        .collect()
}
