use crate::error::Degeneracy;
use serde::{Deserialize, Serialize};

/// Per-feature detail of a univariate test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureReport {
    pub statistics: Vec<f64>,
    pub p_values: Vec<f64>,
    /// Statistic values that would be rejected at the corrected level
    pub distance_thresholds: Vec<f64>,
    pub rejected: Vec<bool>,
}

impl FeatureReport {
    /// Indices of the features flagged as drifted
    pub fn drifted_features(&self) -> Vec<usize> {
        self.rejected
            .iter()
            .enumerate()
            .filter(|(_, r)| **r)
            .map(|(j, _)| j)
            .collect()
    }
}

/// Outcome of comparing one batch against the reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftPrediction {
    pub drift_detected: bool,
    /// Observed statistic; for per-feature methods, that of the most significant feature
    pub statistic: f64,
    /// For per-feature methods, the smallest per-feature p-value
    pub p_value: f64,
    /// p-value bar: α, or the corrected level for per-feature methods
    pub threshold: f64,
    /// Statistic value at which the null would be rejected
    pub distance_threshold: f64,
    pub features: Option<FeatureReport>,
    pub method: String,
    pub n_reference: usize,
    pub n_test: usize,
    /// Numeric fallbacks taken while fitting or scoring
    pub warnings: Vec<Degeneracy>,
}

impl DriftPrediction {
    pub fn is_reliable(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drifted_features() {
        let report = FeatureReport {
            statistics: vec![0.1, 0.5, 0.2],
            p_values: vec![0.8, 0.001, 0.01],
            distance_thresholds: vec![0.3; 3],
            rejected: vec![false, true, true],
        };
        assert_eq!(report.drifted_features(), vec![1, 2]);
    }
}
