//! Calibration of null distributions
//!
//! Maps observed statistics to p-values and rejection thresholds:
//! - Permutation resampling of the pooled reference and test batch
//! - Disjoint resplits of the reference alone, cached per batch size
//! - Asymptotic distributions for KS, chi-squared and linear-time MMD

mod null;
mod resampling;

pub use null::{EmpiricalNull, NullDistribution};
pub use resampling::{permutation_null, reference_split_null};

use serde::{Deserialize, Serialize};

/// Which rows a permutation null is simulated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullScheme {
    /// Shuffle the pooled reference and test batch at evaluation time
    #[default]
    Pooled,
    /// Resplit the reference once per test-batch size and reuse the result
    ReferenceOnly,
}

/// How p-values are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMode {
    /// Asymptotic for KS, chi-squared and linear-time MMD, permutation otherwise
    #[default]
    Auto,
    /// Always simulate the null
    Permutation,
    /// Parametric approximation; weaker guarantees on small samples
    Asymptotic,
}
