//! Classifier two-sample test
//!
//! A binary classifier is trained to tell reference rows (label 0) from test
//! rows (label 1). Predictions are only ever scored on rows the model did not
//! see during training, either from a stratified train/held-out split or as
//! out-of-fold predictions from stratified K-fold.

use super::univariate::{ks_statistic, Alternative};
use crate::error::{DriftError, Result};
use crate::sample::Sample;
use crate::stats::{binomial_critical_value, binomial_sf, ks_one_sided_p_value};
use crate::utils::{counter_seed, seeded_rng, sort_f64};
use ndarray::{concatenate, Array1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Binary probabilistic classifier supplied by the caller
pub trait Classifier: Send {
    /// Fit on rows with labels (`true` = test batch)
    fn fit(&mut self, x: ArrayView2<f64>, labels: &[bool]) -> Result<()>;

    /// Probability that each row belongs to the test batch
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>>;
}

/// Builds a fresh, unfitted classifier for every split or fold
pub trait ClassifierFactory: Send + Sync {
    fn build(&self, seed: u64) -> Box<dyn Classifier>;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ClassifierFactory for F
where
    F: Fn(u64) -> Box<dyn Classifier> + Send + Sync,
{
    fn build(&self, seed: u64) -> Box<dyn Classifier> {
        self(seed)
    }
}

/// L2-regularised logistic regression fitted by gradient descent
///
/// Features are standardised with statistics of the training rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Fitted coefficients
    pub coefficients: Option<Array1<f64>>,
    /// Fitted intercept
    pub intercept: Option<f64>,
    /// Regularization strength (L2)
    pub alpha: f64,
    /// Maximum iterations
    pub max_iter: usize,
    /// Convergence tolerance
    pub tol: f64,
    /// Learning rate
    pub learning_rate: f64,
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LogisticRegression {
    pub fn new() -> Self {
        Self {
            coefficients: None,
            intercept: None,
            alpha: 0.01,
            max_iter: 500,
            tol: 1e-6,
            learning_rate: 0.5,
            mean: None,
            scale: None,
        }
    }

    /// Set regularization strength
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set maximum iterations
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set learning rate
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.coefficients.is_some()
    }

    fn sigmoid(z: &Array1<f64>) -> Array1<f64> {
        z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, x: ArrayView2<f64>, labels: &[bool]) -> Result<()> {
        let n_samples = x.nrows();
        if n_samples != labels.len() {
            return Err(DriftError::shape(
                format!("{} labels", n_samples),
                format!("{} labels", labels.len()),
            ));
        }
        if n_samples == 0 {
            return Err(DriftError::insufficient("logistic regression", 1, 0));
        }

        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
        let xs = (&x - &mean) / &scale;
        let y: Array1<f64> = labels.iter().map(|&l| if l { 1.0 } else { 0.0 }).collect();

        let mut weights = Array1::zeros(x.ncols());
        let mut bias = 0.0;
        for _ in 0..self.max_iter {
            let linear = xs.dot(&weights) + bias;
            let predictions = Self::sigmoid(&linear);

            let errors = &predictions - &y;
            let dw = (xs.t().dot(&errors) / n_samples as f64) + (self.alpha * &weights);
            let db = errors.mean().unwrap_or(0.0);

            let grad_norm = (dw.mapv(|v| v * v).sum() + db * db).sqrt();
            if grad_norm < self.tol {
                break;
            }
            weights = weights - self.learning_rate * dw;
            bias -= self.learning_rate * db;
        }

        self.coefficients = Some(weights);
        self.intercept = Some(bias);
        self.mean = Some(mean);
        self.scale = Some(scale);
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        match (&self.coefficients, &self.mean, &self.scale) {
            (Some(w), Some(mean), Some(scale)) => {
                let xs = (&x - mean) / scale;
                let linear = xs.dot(w) + self.intercept.unwrap_or(0.0);
                Ok(Self::sigmoid(&linear))
            }
            _ => Err(DriftError::Computation(
                "classifier used before fitting".to_string(),
            )),
        }
    }
}

/// Factory producing unfitted copies of a logistic regression template
#[derive(Debug, Clone, Default)]
pub struct LogisticRegressionFactory {
    template: LogisticRegression,
}

impl LogisticRegressionFactory {
    pub fn new(template: LogisticRegression) -> Self {
        Self { template }
    }
}

impl ClassifierFactory for LogisticRegressionFactory {
    fn build(&self, _seed: u64) -> Box<dyn Classifier> {
        Box::new(LogisticRegression {
            coefficients: None,
            intercept: None,
            mean: None,
            scale: None,
            ..self.template.clone()
        })
    }

    fn name(&self) -> &str {
        "logistic_regression"
    }
}

fn default_train_size() -> Option<f64> {
    Some(0.75)
}

/// Split discipline and scoring of the classifier test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Fraction of each sample used for training; ignored when `n_folds` is set
    #[serde(default = "default_train_size")]
    pub train_size: Option<f64>,
    /// Stratified K-fold with out-of-fold predictions
    #[serde(default)]
    pub n_folds: Option<usize>,
    /// Score hard predictions (accuracy + binomial test) instead of probabilities (one-sided KS)
    #[serde(default)]
    pub binarize_preds: bool,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            train_size: default_train_size(),
            n_folds: None,
            binarize_preds: false,
        }
    }
}

impl ClassifierSettings {
    pub fn validate(&self) -> Result<()> {
        match (self.n_folds, self.train_size) {
            (Some(k), _) if k < 2 => Err(DriftError::InvalidConfiguration(format!(
                "n_folds must be at least 2, got {}",
                k
            ))),
            (Some(_), _) => Ok(()),
            (None, Some(f)) if !(f > 0.0 && f < 1.0) => Err(DriftError::InvalidConfiguration(
                format!("train_size must be in (0, 1), got {}", f),
            )),
            (None, Some(_)) => Ok(()),
            (None, None) => Err(DriftError::InvalidConfiguration(
                "classifier test needs either train_size or n_folds".to_string(),
            )),
        }
    }

    /// Minimum rows in each of the reference and test samples
    pub fn min_samples(&self) -> usize {
        self.n_folds.unwrap_or(2).max(2)
    }
}

/// Result of one classifier test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutcome {
    /// Held-out accuracy, or the one-sided KS distance between predicted probabilities
    pub statistic: f64,
    pub p_value: f64,
    /// Relative error reduction over the majority-class rate, or the KS distance
    pub distance: f64,
    /// Reference rows scored
    pub n_reference_scored: usize,
    /// Test rows scored
    pub n_test_scored: usize,
    binarized: bool,
}

impl ClassifierOutcome {
    /// Statistic value at which the p-value drops below `alpha`
    pub fn threshold(&self, alpha: f64) -> f64 {
        let n = self.n_reference_scored + self.n_test_scored;
        if self.binarized {
            let baseline = self.n_reference_scored.max(self.n_test_scored) as f64 / n as f64;
            binomial_critical_value(n, baseline, alpha) as f64 / n as f64
        } else {
            let en = (self.n_reference_scored * self.n_test_scored) as f64 / n as f64;
            (-alpha.ln() / (2.0 * en)).sqrt()
        }
    }
}

fn stratified_train_split(indices: &mut Vec<usize>, train_size: f64) -> Vec<usize> {
    let n = indices.len();
    let n_train = ((train_size * n as f64).round() as usize).clamp(1, n - 1);
    indices.split_off(n_train)
}

/// Train and score classifiers with strict separation of fitting and scoring rows
pub fn classifier_test(
    reference: &Sample,
    test: &Sample,
    settings: &ClassifierSettings,
    factory: &dyn ClassifierFactory,
    seed: u64,
) -> Result<ClassifierOutcome> {
    let (n_ref, n_test) = (reference.n_samples(), test.n_samples());
    let required = settings.min_samples();
    if n_ref < required || n_test < required {
        return Err(DriftError::insufficient("classifier", required, n_ref.min(n_test)));
    }

    let x = concatenate(Axis(0), &[reference.view(), test.view()])?;
    let labels: Vec<bool> = (0..n_ref + n_test).map(|i| i >= n_ref).collect();

    let mut rng = seeded_rng(seed);
    let mut ref_idx: Vec<usize> = (0..n_ref).collect();
    let mut test_idx: Vec<usize> = (n_ref..n_ref + n_test).collect();
    ref_idx.shuffle(&mut rng);
    test_idx.shuffle(&mut rng);

    let fit_and_score = |train: &[usize], held_out: &[usize], model_seed: u64| -> Result<Vec<(usize, f64)>> {
        let mut model = factory.build(model_seed);
        let train_labels: Vec<bool> = train.iter().map(|&i| labels[i]).collect();
        model.fit(x.select(Axis(0), train).view(), &train_labels)?;
        let probs = model.predict_proba(x.select(Axis(0), held_out).view())?;
        if probs.len() != held_out.len() {
            return Err(DriftError::shape(
                format!("{} predictions", held_out.len()),
                format!("{} predictions", probs.len()),
            ));
        }
        Ok(held_out.iter().copied().zip(probs.iter().copied()).collect())
    };

    let scored: Vec<(usize, f64)> = match settings.n_folds {
        Some(k) => {
            let folds: Vec<Result<Vec<(usize, f64)>>> = (0..k)
                .into_par_iter()
                .map(|f| {
                    let (mut train, mut held_out) = (Vec::new(), Vec::new());
                    for group in [&ref_idx, &test_idx] {
                        for (pos, &i) in group.iter().enumerate() {
                            if pos % k == f {
                                held_out.push(i);
                            } else {
                                train.push(i);
                            }
                        }
                    }
                    fit_and_score(&train, &held_out, counter_seed(seed, f as u64))
                })
                .collect();
            let mut all = Vec::with_capacity(n_ref + n_test);
            for fold in folds {
                all.extend(fold?);
            }
            all
        }
        None => {
            let train_size = settings.train_size.unwrap_or(0.75);
            let ref_held = stratified_train_split(&mut ref_idx, train_size);
            let test_held = stratified_train_split(&mut test_idx, train_size);
            let train: Vec<usize> = ref_idx.iter().chain(test_idx.iter()).copied().collect();
            let held_out: Vec<usize> = ref_held.iter().chain(test_held.iter()).copied().collect();
            fit_and_score(&train, &held_out, counter_seed(seed, 0))?
        }
    };

    let n_reference_scored = scored.iter().filter(|(i, _)| !labels[*i]).count();
    let n_test_scored = scored.len() - n_reference_scored;
    let n = scored.len();

    let outcome = if settings.binarize_preds {
        let correct = scored.iter().filter(|(i, p)| (*p > 0.5) == labels[*i]).count();
        let accuracy = correct as f64 / n as f64;
        let baseline = n_reference_scored.max(n_test_scored) as f64 / n as f64;
        ClassifierOutcome {
            statistic: accuracy,
            p_value: binomial_sf(correct, n, baseline),
            distance: (accuracy - baseline) / (1.0 - baseline),
            n_reference_scored,
            n_test_scored,
            binarized: true,
        }
    } else {
        let mut probs_ref: Vec<f64> = scored.iter().filter(|(i, _)| !labels[*i]).map(|(_, p)| *p).collect();
        let mut probs_test: Vec<f64> = scored.iter().filter(|(i, _)| labels[*i]).map(|(_, p)| *p).collect();
        sort_f64(&mut probs_ref);
        sort_f64(&mut probs_test);
        let d_plus = ks_statistic(&probs_ref, &probs_test, Alternative::Greater);
        ClassifierOutcome {
            statistic: d_plus,
            p_value: ks_one_sided_p_value(d_plus, n_reference_scored, n_test_scored),
            distance: d_plus,
            n_reference_scored,
            n_test_scored,
            binarized: false,
        }
    };

    tracing::debug!(
        statistic = outcome.statistic,
        p_value = outcome.p_value,
        n_scored = n,
        "Classifier test finished"
    );
    Ok(outcome)
}
