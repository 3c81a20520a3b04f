//! Offline drift detection
//!
//! One-shot comparisons of a test batch against a reference sample:
//! statistic, calibrated p-value, threshold and decision.

mod detector;
mod prediction;
mod reference;

pub use detector::OfflineDetector;
pub use prediction::{DriftPrediction, FeatureReport};
