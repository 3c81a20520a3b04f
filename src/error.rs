//! Error types for drift detection

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for drift detection operations
pub type Result<T> = std::result::Result<T, DriftError>;

/// Main error type for the drift detection engine
#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Invalid input shape: expected {expected}, got {actual}")]
    InvalidInputShape { expected: String, actual: String },

    #[error("Insufficient samples for {method}: need at least {required}, got {actual}")]
    InsufficientSamples {
        method: String,
        required: usize,
        actual: usize,
    },

    #[error("Reference sample is empty")]
    EmptyReference,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Preprocessing error: {0}")]
    Preprocessing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DriftError {
    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        DriftError::InvalidInputShape {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn insufficient(method: &str, required: usize, actual: usize) -> Self {
        DriftError::InsufficientSamples {
            method: method.to_string(),
            required,
            actual,
        }
    }
}

impl From<serde_json::Error> for DriftError {
    fn from(err: serde_json::Error) -> Self {
        DriftError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for DriftError {
    fn from(err: ndarray::ShapeError) -> Self {
        DriftError::InvalidInputShape {
            expected: "rectangular batch".to_string(),
            actual: err.to_string(),
        }
    }
}

/// Kind of numeric degeneracy recovered by a documented fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegeneracyKind {
    /// Reference feature has zero variance; the feature gives no drift signal
    ZeroVariance,
    /// Only one category observed; the chi-squared test has no degrees of freedom
    SingleCategory,
    /// Kernel bandwidth heuristic collapsed to zero
    ZeroBandwidth,
    /// Duplicate kernel centres were jittered
    DuplicateCenters,
    /// No regularisation candidate met the relative-difference bound
    Regularization,
    /// Linear system needed extra ridge regularisation
    SingularMatrix,
    /// Statistic has zero spread under the null
    ZeroNullVariance,
    /// Every bootstrap stream alarmed before the thresholds were fully configured
    ExhaustedBootstraps,
    /// No reference draw for the initial online window fell below the first threshold
    WindowInitialisation,
}

/// Warning-level signal surfaced with results so callers can audit reliability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degeneracy {
    /// What degenerated
    pub kind: DegeneracyKind,
    /// Affected feature, for per-feature tests
    pub feature: Option<usize>,
    /// Human-readable detail
    pub message: String,
}

impl Degeneracy {
    pub fn new(kind: DegeneracyKind, message: impl Into<String>) -> Self {
        let degeneracy = Self {
            kind,
            feature: None,
            message: message.into(),
        };
        tracing::warn!(kind = ?degeneracy.kind, detail = %degeneracy.message, "Numeric degeneracy recovered");
        degeneracy
    }

    pub fn for_feature(kind: DegeneracyKind, feature: usize, message: impl Into<String>) -> Self {
        let degeneracy = Self {
            kind,
            feature: Some(feature),
            message: message.into(),
        };
        tracing::warn!(
            kind = ?degeneracy.kind,
            feature = feature,
            detail = %degeneracy.message,
            "Numeric degeneracy recovered"
        );
        degeneracy
    }
}
