//! Kolosal Drift - label-free drift detection engine
//!
//! This crate tests whether incoming data still follows the distribution of a
//! reference sample:
//! - Kernel two-sample statistics (MMD, LSDD, learned kernels)
//! - Per-feature KS and chi-squared tests with multiple-testing correction
//! - Classifier-based two-sample tests
//! - Permutation and asymptotic calibration of p-values and thresholds
//! - Online detection over a sliding window with bootstrap-simulated thresholds
//!
//! # Modules
//!
//! ## Core
//! - [`sample`] - Immutable batches of feature vectors
//! - [`kernel`] - Gaussian RBF and deep kernels, bandwidth heuristics
//! - [`statistic`] - Discrepancy statistics between reference and test data
//! - [`calibration`] - Null distributions, p-values and thresholds
//! - [`correction`] - Bonferroni and Benjamini-Hochberg aggregation
//!
//! ## Detectors
//! - [`offline`] - Batch detector with lazy recalibration and reference updates
//! - [`online`] - Sequential detector with latched drift declaration
//! - [`snapshot`] - Persisted detector state
//!
//! ## Support
//! - [`config`] - Serde configuration records with builders
//! - [`preprocess`] - Preprocessing adapters applied before testing
//! - [`stats`] - Asymptotic survival functions
//! - [`utils`] - Seeded random streams, quantiles and small linear algebra
//!
//! # Example
//!
//! ```no_run
//! use kolosal_drift::prelude::*;
//!
//! # fn main() -> kolosal_drift::Result<()> {
//! let reference = Sample::from_column(&[0.1, -0.4, 0.3, 1.2, -0.8, 0.5, -0.1, 0.9])?;
//! let detector = OfflineDetector::new(reference, DetectorConfig::new(Method::ks()))?;
//! let batch = Sample::from_column(&[2.1, 2.5, 1.9, 3.0])?;
//! let prediction = detector.predict(&batch)?;
//! println!("drift: {} (p = {:.3})", prediction.drift_detected, prediction.p_value);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Data and kernels
pub mod sample;
pub mod kernel;
pub mod stats;

// Test engine
pub mod statistic;
pub mod calibration;
pub mod correction;

// Configuration and preprocessing
pub mod config;
pub mod preprocess;

// Detectors
pub mod offline;
pub mod online;
pub mod snapshot;

// Utilities
pub mod utils;

pub use error::{Degeneracy, DegeneracyKind, DriftError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{Degeneracy, DegeneracyKind, DriftError, Result};

    // Data
    pub use crate::sample::Sample;

    // Kernels
    pub use crate::kernel::{Bandwidth, DeepKernel, GaussianRbf};

    // Statistics
    pub use crate::statistic::{
        Alternative, ClassifierFactory, ClassifierSettings, LearnedKernelSettings, Method, MmdEstimator,
    };

    // Calibration and correction
    pub use crate::calibration::{NullScheme, PValueMode};
    pub use crate::correction::{aggregate, Correction, CorrectionOutcome};

    // Configuration
    pub use crate::config::{DetectorConfig, ErrorControl, OnlineConfig, OnlineMethod, ReferenceUpdate};

    // Preprocessing
    pub use crate::preprocess::{Preprocessor, RandomProjection, UncertaintyKind, UncertaintyPreprocessor};

    // Detectors
    pub use crate::offline::{DriftPrediction, FeatureReport, OfflineDetector};
    pub use crate::online::{OnlineDetector, OnlinePrediction};
    pub use crate::snapshot::{DetectorSnapshot, OnlineSnapshot};
}
