//! Discrepancy statistics between a reference and a test sample
//!
//! Each method is a variant of [`Method`] (configuration) and of
//! [`Statistic`] (the method fitted to a reference). Permutation-calibrated
//! methods additionally expose a [`SplitStatistic`] evaluator over pooled rows
//! so the calibration module can resample index splits without copying data.

mod classifier;
mod learned_kernel;
mod lsdd;
mod mmd;
mod univariate;

pub use classifier::{
    classifier_test, Classifier, ClassifierFactory, ClassifierOutcome, ClassifierSettings,
    LogisticRegression, LogisticRegressionFactory,
};
pub use learned_kernel::{learned_kernel_test, power_objective, LearnedKernelOutcome, LearnedKernelSettings};
pub use lsdd::{lambda_grid, CenterSplit, LsddModel, LsddStatistic, Standardizer, DEFAULT_LAMBDA_RD_MAX};
pub use mmd::{linear_asymptotic, linear_terms, mmd2_from_gram, GramSplit, MmdEstimator, MmdSplit, MmdStatistic, PairSplit};
pub use univariate::{chi_squared_statistic, ks_statistic, Alternative, ColumnSplit, FeatureKind, UnivariateStatistic};

pub(crate) use lsdd::{center_gram, draw_centers, mean_rows, select_lambda};

use crate::error::{Degeneracy, DriftError, Result};
use crate::kernel::Bandwidth;
use crate::preprocess::Preprocessor;
use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A statistic evaluated on two groups of row indices into a shared pool
pub trait SplitStatistic: Sync {
    /// Rows in the pool
    fn n_rows(&self) -> usize;

    /// Values returned per evaluation (one per feature for univariate tests)
    fn n_outputs(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64>;
}

fn default_lambda_rd_max() -> f64 {
    DEFAULT_LAMBDA_RD_MAX
}

/// Detection method and its statistic-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Method {
    /// Kernel maximum mean discrepancy
    Mmd {
        #[serde(default)]
        estimator: MmdEstimator,
        #[serde(default)]
        bandwidth: Bandwidth,
    },
    /// Least-squares density difference
    Lsdd {
        #[serde(default)]
        bandwidth: Bandwidth,
        #[serde(default)]
        n_kernel_centers: Option<usize>,
        #[serde(default = "default_lambda_rd_max")]
        lambda_rd_max: f64,
    },
    /// Per-feature Kolmogorov-Smirnov
    Ks {
        #[serde(default)]
        alternative: Alternative,
    },
    /// Per-feature chi-squared on integer category codes
    ChiSquared,
    /// KS on continuous features, chi-squared on the listed categorical ones
    Tabular {
        #[serde(default)]
        categorical: Vec<usize>,
        #[serde(default)]
        alternative: Alternative,
    },
    /// Domain classifier trained to tell reference from test
    Classifier(ClassifierSettings),
    /// MMD with a kernel trained on a held-out split
    LearnedKernel(LearnedKernelSettings),
}

impl Default for Method {
    fn default() -> Self {
        Method::Mmd {
            estimator: MmdEstimator::default(),
            bandwidth: Bandwidth::default(),
        }
    }
}

impl Method {
    pub fn mmd() -> Self {
        Self::default()
    }

    pub fn lsdd() -> Self {
        Method::Lsdd {
            bandwidth: Bandwidth::default(),
            n_kernel_centers: None,
            lambda_rd_max: DEFAULT_LAMBDA_RD_MAX,
        }
    }

    pub fn ks() -> Self {
        Method::Ks {
            alternative: Alternative::TwoSided,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Mmd { .. } => "mmd",
            Method::Lsdd { .. } => "lsdd",
            Method::Ks { .. } => "ks",
            Method::ChiSquared => "chi_squared",
            Method::Tabular { .. } => "tabular",
            Method::Classifier(_) => "classifier",
            Method::LearnedKernel(_) => "learned_kernel",
        }
    }

    /// Whether the method produces one statistic per feature
    pub fn is_per_feature(&self) -> bool {
        matches!(self, Method::Ks { .. } | Method::ChiSquared | Method::Tabular { .. })
    }

    /// Whether an asymptotic null is available
    pub fn has_asymptotic_null(&self) -> bool {
        match self {
            Method::Mmd { estimator, .. } => *estimator == MmdEstimator::Linear,
            Method::Ks { .. } | Method::ChiSquared | Method::Tabular { .. } => true,
            _ => false,
        }
    }

    /// Minimum rows required in the test batch (and in the reference)
    pub fn min_samples(&self) -> usize {
        match self {
            Method::Mmd { estimator, .. } => estimator.min_samples(),
            Method::Lsdd { .. } => 1,
            Method::Ks { .. } | Method::ChiSquared | Method::Tabular { .. } => 1,
            Method::Classifier(settings) => settings.min_samples(),
            Method::LearnedKernel(_) => 4,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Method::Mmd { bandwidth, .. } => bandwidth.validate(),
            Method::Lsdd {
                bandwidth,
                n_kernel_centers,
                lambda_rd_max,
            } => {
                bandwidth.validate()?;
                if *n_kernel_centers == Some(0) {
                    return Err(DriftError::InvalidConfiguration(
                        "n_kernel_centers must be positive".to_string(),
                    ));
                }
                if !(*lambda_rd_max > 0.0 && *lambda_rd_max < 1.0) {
                    return Err(DriftError::InvalidConfiguration(format!(
                        "lambda_rd_max must be in (0, 1), got {}",
                        lambda_rd_max
                    )));
                }
                Ok(())
            }
            Method::Ks { .. } | Method::ChiSquared | Method::Tabular { .. } => Ok(()),
            Method::Classifier(settings) => settings.validate(),
            Method::LearnedKernel(settings) => settings.validate(),
        }
    }
}

/// Caller-supplied collaborators needed by some methods
#[derive(Clone, Default)]
pub struct FitContext {
    pub seed: u64,
    /// Required by [`Method::Classifier`]; logistic regression when absent
    pub classifier_factory: Option<Arc<dyn ClassifierFactory>>,
    /// Optional projection for [`Method::LearnedKernel`]
    pub kernel_projection: Option<Arc<dyn Preprocessor>>,
}

/// A method fitted to a reference sample
#[derive(Clone)]
pub enum Statistic {
    Mmd(MmdStatistic),
    Lsdd(LsddStatistic),
    Univariate(UnivariateStatistic),
    Classifier {
        settings: ClassifierSettings,
        factory: Arc<dyn ClassifierFactory>,
    },
    LearnedKernel {
        settings: LearnedKernelSettings,
        projection: Option<Arc<dyn Preprocessor>>,
    },
}

impl fmt::Debug for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Mmd(s) => f.debug_tuple("Mmd").field(s.kernel()).field(&s.estimator()).finish(),
            Statistic::Lsdd(s) => f.debug_tuple("Lsdd").field(&s.model().lambda()).finish(),
            Statistic::Univariate(s) => f.debug_tuple("Univariate").field(&s.kinds()).finish(),
            Statistic::Classifier { settings, factory } => f
                .debug_struct("Classifier")
                .field("settings", settings)
                .field("factory", &factory.name())
                .finish(),
            Statistic::LearnedKernel { settings, projection } => f
                .debug_struct("LearnedKernel")
                .field("settings", settings)
                .field("projection", &projection.as_ref().map(|p| p.name().to_string()))
                .finish(),
        }
    }
}

impl Statistic {
    /// Fit `method` to the reference; degeneracies are returned, not raised
    pub fn fit(method: &Method, reference: &Sample, ctx: &FitContext) -> Result<(Self, Vec<Degeneracy>)> {
        method.validate()?;
        let n = reference.n_samples();
        if n == 0 {
            return Err(DriftError::EmptyReference);
        }
        if n < method.min_samples() {
            return Err(DriftError::insufficient(method.name(), method.min_samples(), n));
        }
        let fitted = match method {
            Method::Mmd { estimator, bandwidth } => {
                let (stat, warning) = MmdStatistic::fit(reference, *estimator, bandwidth)?;
                (Statistic::Mmd(stat), warning.into_iter().collect())
            }
            Method::Lsdd {
                bandwidth,
                n_kernel_centers,
                lambda_rd_max,
            } => {
                let (stat, warnings) =
                    LsddStatistic::fit(reference, bandwidth, *n_kernel_centers, *lambda_rd_max, ctx.seed)?;
                (Statistic::Lsdd(stat), warnings)
            }
            Method::Ks { alternative } => {
                let stat = UnivariateStatistic::continuous(reference, *alternative)?;
                let warnings = stat.degeneracies();
                (Statistic::Univariate(stat), warnings)
            }
            Method::ChiSquared => {
                let stat = UnivariateStatistic::categorical(reference)?;
                let warnings = stat.degeneracies();
                (Statistic::Univariate(stat), warnings)
            }
            Method::Tabular {
                categorical,
                alternative,
            } => {
                let stat = UnivariateStatistic::tabular(reference, categorical, *alternative)?;
                let warnings = stat.degeneracies();
                (Statistic::Univariate(stat), warnings)
            }
            Method::Classifier(settings) => {
                let factory: Arc<dyn ClassifierFactory> = match &ctx.classifier_factory {
                    Some(f) => Arc::clone(f),
                    None => Arc::new(LogisticRegressionFactory::default()),
                };
                (
                    Statistic::Classifier {
                        settings: settings.clone(),
                        factory,
                    },
                    Vec::new(),
                )
            }
            Method::LearnedKernel(settings) => (
                Statistic::LearnedKernel {
                    settings: settings.clone(),
                    projection: ctx.kernel_projection.clone(),
                },
                Vec::new(),
            ),
        };
        Ok(fitted)
    }

    /// Observed statistic(s) between the fitted reference and `test`
    ///
    /// Methods that train a model on part of the data (classifier, learned
    /// kernel) need the reference again and draw their split from `seed`.
    pub fn compute(&self, reference: &Sample, test: &Sample, seed: u64) -> Result<Vec<f64>> {
        test.check_features(reference.n_features())?;
        match self {
            Statistic::Mmd(s) => {
                if test.n_samples() < s.min_samples() {
                    return Err(DriftError::insufficient("mmd", s.min_samples(), test.n_samples()));
                }
                Ok(vec![s.compute(test)])
            }
            Statistic::Lsdd(s) => Ok(vec![s.compute(test)]),
            Statistic::Univariate(s) => Ok(s.compute(test)?.0),
            Statistic::Classifier { settings, factory } => {
                let outcome = classifier_test(reference, test, settings, factory.as_ref(), seed)?;
                Ok(vec![outcome.statistic])
            }
            Statistic::LearnedKernel { settings, projection } => {
                let outcome = learned_kernel_test(reference, test, settings, projection.as_deref(), 1, seed)?;
                Ok(vec![outcome.statistic])
            }
        }
    }
}

/// One-shot statistic computation: fit `method` to `reference` and score `test`
pub fn compute(method: &Method, reference: &Sample, test: &Sample, seed: u64) -> Result<Vec<f64>> {
    let ctx = FitContext {
        seed,
        ..FitContext::default()
    };
    let (statistic, _) = Statistic::fit(method, reference, &ctx)?;
    statistic.compute(reference, test, seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn normal_sample(n: usize, d: usize, shift: f64, seed: u64) -> Sample {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let data = Array2::from_shape_fn((n, d), |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            z + shift
        });
        Sample::new(data).unwrap()
    }

    #[test]
    fn test_method_json_tags() {
        let json = r#"{"type": "mmd", "estimator": "linear"}"#;
        let method: Method = serde_json::from_str(json).unwrap();
        assert_eq!(
            method,
            Method::Mmd {
                estimator: MmdEstimator::Linear,
                bandwidth: Bandwidth::MedianHeuristic,
            }
        );
        let method: Method = serde_json::from_str(r#"{"type": "lsdd"}"#).unwrap();
        assert_eq!(method, Method::lsdd());
        let method: Method = serde_json::from_str(r#"{"type": "classifier", "n_folds": 5}"#).unwrap();
        assert!(matches!(method, Method::Classifier(ref s) if s.n_folds == Some(5)));
    }

    #[test]
    fn test_method_validation() {
        let bad = Method::Lsdd {
            bandwidth: Bandwidth::MedianHeuristic,
            n_kernel_centers: Some(0),
            lambda_rd_max: 0.2,
        };
        assert!(bad.validate().is_err());
        let bad = Method::Mmd {
            estimator: MmdEstimator::Unbiased,
            bandwidth: Bandwidth::Fixed(vec![]),
        };
        assert!(bad.validate().is_err());
        assert!(Method::ks().validate().is_ok());
    }

    #[test]
    fn test_compute_dimension_mismatch() {
        let reference = normal_sample(50, 2, 0.0, 1);
        let test = normal_sample(50, 3, 0.0, 2);
        let err = compute(&Method::mmd(), &reference, &test, 0).unwrap_err();
        assert!(matches!(err, DriftError::InvalidInputShape { .. }));
    }

    #[test]
    fn test_compute_per_feature_outputs() {
        let reference = normal_sample(100, 3, 0.0, 1);
        let test = normal_sample(100, 3, 0.0, 2);
        let values = compute(&Method::ks(), &reference, &test, 0).unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_insufficient_test_rows_for_unbiased_mmd() {
        let reference = normal_sample(20, 1, 0.0, 1);
        let test = normal_sample(1, 1, 0.0, 2);
        let err = compute(&Method::mmd(), &reference, &test, 0).unwrap_err();
        assert!(matches!(err, DriftError::InsufficientSamples { .. }));
    }

    #[test]
    fn test_mmd_grows_with_shift() {
        let reference = normal_sample(80, 2, 0.0, 1);
        let near = compute(&Method::mmd(), &reference, &normal_sample(80, 2, 0.0, 2), 0).unwrap()[0];
        let far = compute(&Method::mmd(), &reference, &normal_sample(80, 2, 2.0, 3), 0).unwrap()[0];
        assert!(far > near);
    }
}
