//! Preprocessing adapters
//!
//! A [`Preprocessor`] maps a raw batch to the feature space the statistics
//! operate on. Detectors treat it as an opaque, deterministic function.

use crate::error::{DriftError, Result};
use crate::sample::Sample;
use crate::utils::seeded_rng;
use ndarray::{Array1, Array2, Axis};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Batch transform applied before drift statistics are computed
pub trait Preprocessor: Send + Sync {
    fn transform(&self, batch: &Sample) -> Result<Sample>;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Passes batches through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Preprocessor for Identity {
    fn transform(&self, batch: &Sample) -> Result<Sample> {
        Ok(batch.clone())
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Wraps a closure, typically an embedding model owned by the caller
pub struct FnPreprocessor<F> {
    name: String,
    f: F,
}

impl<F> FnPreprocessor<F>
where
    F: Fn(&Sample) -> Result<Sample> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Preprocessor for FnPreprocessor<F>
where
    F: Fn(&Sample) -> Result<Sample> + Send + Sync,
{
    fn transform(&self, batch: &Sample) -> Result<Sample> {
        (self.f)(batch).map_err(|e| match e {
            DriftError::Preprocessing(_) => e,
            other => DriftError::Preprocessing(format!("{}: {}", self.name, other)),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared preprocessor from a closure
pub fn from_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Preprocessor>
where
    F: Fn(&Sample) -> Result<Sample> + Send + Sync + 'static,
{
    Arc::new(FnPreprocessor::new(name, f))
}

/// Untrained linear encoder with Gaussian weights scaled by 1/√k
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomProjection {
    weights: Array2<f64>,
}

impl RandomProjection {
    pub fn new(input_dim: usize, output_dim: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(DriftError::InvalidConfiguration(format!(
                "projection dimensions must be positive, got {} -> {}",
                input_dim, output_dim
            )));
        }
        let mut rng = seeded_rng(seed);
        let scale = 1.0 / (output_dim as f64).sqrt();
        let weights = Array2::from_shape_fn((input_dim, output_dim), |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            z * scale
        });
        Ok(Self { weights })
    }

    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }
}

impl Preprocessor for RandomProjection {
    fn transform(&self, batch: &Sample) -> Result<Sample> {
        batch.check_features(self.input_dim())?;
        Sample::new(batch.view().dot(&self.weights))
    }

    fn name(&self) -> &str {
        "random_projection"
    }
}

/// Probability model whose predictive uncertainty is monitored
pub trait ProbabilityModel: Send + Sync {
    /// Class probabilities, one row per instance; a single column is read as P(class 1)
    fn predict_proba(&self, batch: &Sample) -> Result<Array2<f64>>;
}

/// Scalar uncertainty derived from class probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyKind {
    /// Shannon entropy of the predicted distribution
    #[default]
    Entropy,
    /// One minus the gap between the two most likely classes
    Margin,
}

/// Maps each instance to the model's uncertainty about it
///
/// Combined with the KS method this monitors drift in model uncertainty
/// rather than in the raw inputs.
pub struct UncertaintyPreprocessor {
    model: Arc<dyn ProbabilityModel>,
    kind: UncertaintyKind,
}

impl UncertaintyPreprocessor {
    pub fn new(model: Arc<dyn ProbabilityModel>, kind: UncertaintyKind) -> Self {
        Self { model, kind }
    }

    fn uncertainty(&self, probs: &Array1<f64>) -> f64 {
        match self.kind {
            UncertaintyKind::Entropy => probs
                .iter()
                .filter(|&&p| p > 0.0)
                .map(|&p| -p * p.ln())
                .sum(),
            UncertaintyKind::Margin => {
                let (mut top, mut second) = (0.0f64, 0.0f64);
                for &p in probs.iter() {
                    if p > top {
                        second = top;
                        top = p;
                    } else if p > second {
                        second = p;
                    }
                }
                1.0 - (top - second)
            }
        }
    }
}

impl Preprocessor for UncertaintyPreprocessor {
    fn transform(&self, batch: &Sample) -> Result<Sample> {
        let probs = self.model.predict_proba(batch)?;
        if probs.nrows() != batch.n_samples() {
            return Err(DriftError::Preprocessing(format!(
                "model returned {} rows for a batch of {}",
                probs.nrows(),
                batch.n_samples()
            )));
        }
        let values: Vec<f64> = probs
            .axis_iter(Axis(0))
            .map(|row| {
                let row = if row.len() == 1 {
                    Array1::from(vec![1.0 - row[0], row[0]])
                } else {
                    row.to_owned()
                };
                self.uncertainty(&row)
            })
            .collect();
        Sample::from_column(&values)
    }

    fn name(&self) -> &str {
        match self.kind {
            UncertaintyKind::Entropy => "entropy_uncertainty",
            UncertaintyKind::Margin => "margin_uncertainty",
        }
    }
}
