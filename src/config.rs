//! Detector configuration
//!
//! Both configs are plain serde records. Fields holding caller code
//! (preprocessors, classifier factories, kernel projections) are skipped when
//! serialising and must be attached again after loading.

use crate::calibration::{NullScheme, PValueMode};
use crate::correction::Correction;
use crate::error::{DriftError, Result};
use crate::kernel::Bandwidth;
use crate::preprocess::Preprocessor;
use crate::statistic::{ClassifierFactory, FitContext, Method, DEFAULT_LAMBDA_RD_MAX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How an offline detector folds observed batches into its reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceUpdate {
    /// Reference stays fixed
    #[default]
    None,
    /// Keep the most recent `n` rows
    Last(usize),
    /// Uniform reservoir of `n` rows over everything seen
    Reservoir(usize),
}

fn check_alpha(alpha: f64) -> Result<()> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(DriftError::InvalidConfiguration(format!(
            "alpha must be in (0, 1), got {}",
            alpha
        )))
    }
}

/// Configuration of an offline detector
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Statistic and its parameters
    pub method: Method,

    /// Significance level
    pub alpha: f64,

    /// Resampling iterations for permutation nulls
    pub n_permutations: usize,

    /// Multiple-testing rule for per-feature methods
    pub correction: Correction,

    /// Rows the permutation null is simulated from
    pub null_scheme: NullScheme,

    pub p_value_mode: PValueMode,

    pub reference_update: ReferenceUpdate,

    /// Sub-sample the reference to at most this many rows
    pub max_reference_size: Option<usize>,

    /// Seed for every random draw the detector makes
    pub seed: u64,

    #[serde(skip)]
    pub preprocessor: Option<Arc<dyn Preprocessor>>,

    #[serde(skip)]
    pub classifier_factory: Option<Arc<dyn ClassifierFactory>>,

    #[serde(skip)]
    pub kernel_projection: Option<Arc<dyn Preprocessor>>,
}

impl fmt::Debug for DetectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorConfig")
            .field("method", &self.method)
            .field("alpha", &self.alpha)
            .field("n_permutations", &self.n_permutations)
            .field("correction", &self.correction)
            .field("null_scheme", &self.null_scheme)
            .field("p_value_mode", &self.p_value_mode)
            .field("reference_update", &self.reference_update)
            .field("max_reference_size", &self.max_reference_size)
            .field("seed", &self.seed)
            .field("preprocessor", &self.preprocessor.as_ref().map(|p| p.name().to_string()))
            .field("classifier_factory", &self.classifier_factory.as_ref().map(|c| c.name().to_string()))
            .field("kernel_projection", &self.kernel_projection.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            alpha: 0.05,
            n_permutations: 100,
            correction: Correction::Bonferroni,
            null_scheme: NullScheme::Pooled,
            p_value_mode: PValueMode::Auto,
            reference_update: ReferenceUpdate::None,
            max_reference_size: None,
            seed: 0,
            preprocessor: None,
            classifier_factory: None,
            kernel_projection: None,
        }
    }
}

impl DetectorConfig {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_permutations(mut self, n: usize) -> Self {
        self.n_permutations = n;
        self
    }

    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_null_scheme(mut self, scheme: NullScheme) -> Self {
        self.null_scheme = scheme;
        self
    }

    pub fn with_p_value_mode(mut self, mode: PValueMode) -> Self {
        self.p_value_mode = mode;
        self
    }

    pub fn with_reference_update(mut self, update: ReferenceUpdate) -> Self {
        self.reference_update = update;
        self
    }

    pub fn with_max_reference_size(mut self, n: usize) -> Self {
        self.max_reference_size = Some(n);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_classifier_factory(mut self, factory: Arc<dyn ClassifierFactory>) -> Self {
        self.classifier_factory = Some(factory);
        self
    }

    pub fn with_kernel_projection(mut self, projection: Arc<dyn Preprocessor>) -> Self {
        self.kernel_projection = Some(projection);
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_alpha(self.alpha)?;
        if self.n_permutations == 0 {
            return Err(DriftError::InvalidConfiguration(
                "n_permutations must be positive".to_string(),
            ));
        }
        if self.max_reference_size == Some(0) {
            return Err(DriftError::InvalidConfiguration(
                "max_reference_size must be positive".to_string(),
            ));
        }
        if matches!(self.reference_update, ReferenceUpdate::Last(0) | ReferenceUpdate::Reservoir(0)) {
            return Err(DriftError::InvalidConfiguration(
                "reference update size must be positive".to_string(),
            ));
        }
        if self.p_value_mode == PValueMode::Asymptotic && !self.method.has_asymptotic_null() {
            return Err(DriftError::InvalidConfiguration(format!(
                "no asymptotic null for method {}",
                self.method.name()
            )));
        }
        self.method.validate()
    }

    pub(crate) fn fit_context(&self) -> FitContext {
        FitContext {
            seed: self.seed,
            classifier_factory: self.classifier_factory.clone(),
            kernel_projection: self.kernel_projection.clone(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Statistic maintained by an online detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineMethod {
    #[default]
    Mmd,
    Lsdd,
}

/// Control of false alarms across repeated looks at the stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorControl {
    /// Expected number of steps between false alarms on a no-drift stream
    ExpectedRunTime(f64),
    /// Probability `alpha` of any false alarm within `horizon` steps
    Horizon { alpha: f64, horizon: usize },
}

impl Default for ErrorControl {
    fn default() -> Self {
        ErrorControl::ExpectedRunTime(150.0)
    }
}

impl ErrorControl {
    /// Per-step false positive rate implied by the control target
    pub fn fpr(&self) -> f64 {
        match *self {
            ErrorControl::ExpectedRunTime(ert) => 1.0 / ert,
            ErrorControl::Horizon { alpha, horizon } => 1.0 - (1.0 - alpha).powf(1.0 / horizon as f64),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            ErrorControl::ExpectedRunTime(ert) if !(ert > 1.0 && ert.is_finite()) => Err(
                DriftError::InvalidConfiguration(format!("expected run time must exceed 1, got {}", ert)),
            ),
            ErrorControl::Horizon { horizon: 0, .. } => Err(DriftError::InvalidConfiguration(
                "horizon must be positive".to_string(),
            )),
            ErrorControl::Horizon { alpha, .. } => check_alpha(alpha),
            ErrorControl::ExpectedRunTime(_) => Ok(()),
        }
    }
}

/// Configuration of an online detector
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub method: OnlineMethod,

    pub error_control: ErrorControl,

    /// Points in the sliding test window
    pub window_size: usize,

    /// Bootstrap streams simulated to set the thresholds
    pub n_bootstraps: usize,

    pub bandwidth: Bandwidth,

    /// LSDD kernel centres; defaults to twice the window size
    pub n_kernel_centers: Option<usize>,

    pub lambda_rd_max: f64,

    pub seed: u64,

    #[serde(skip)]
    pub preprocessor: Option<Arc<dyn Preprocessor>>,
}

impl fmt::Debug for OnlineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineConfig")
            .field("method", &self.method)
            .field("error_control", &self.error_control)
            .field("window_size", &self.window_size)
            .field("n_bootstraps", &self.n_bootstraps)
            .field("bandwidth", &self.bandwidth)
            .field("n_kernel_centers", &self.n_kernel_centers)
            .field("lambda_rd_max", &self.lambda_rd_max)
            .field("seed", &self.seed)
            .field("preprocessor", &self.preprocessor.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            method: OnlineMethod::Mmd,
            error_control: ErrorControl::default(),
            window_size: 10,
            n_bootstraps: 1000,
            bandwidth: Bandwidth::MedianHeuristic,
            n_kernel_centers: None,
            lambda_rd_max: DEFAULT_LAMBDA_RD_MAX,
            seed: 0,
            preprocessor: None,
        }
    }
}

impl OnlineConfig {
    pub fn new(method: OnlineMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_expected_run_time(mut self, ert: f64) -> Self {
        self.error_control = ErrorControl::ExpectedRunTime(ert);
        self
    }

    pub fn with_horizon(mut self, alpha: f64, horizon: usize) -> Self {
        self.error_control = ErrorControl::Horizon { alpha, horizon };
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_bootstraps(mut self, n: usize) -> Self {
        self.n_bootstraps = n;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_kernel_centers(mut self, n: usize) -> Self {
        self.n_kernel_centers = Some(n);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.error_control.validate()?;
        if self.window_size < 2 {
            return Err(DriftError::InvalidConfiguration(format!(
                "window_size must be at least 2, got {}",
                self.window_size
            )));
        }
        if self.n_bootstraps == 0 {
            return Err(DriftError::InvalidConfiguration(
                "n_bootstraps must be positive".to_string(),
            ));
        }
        if self.n_kernel_centers == Some(0) {
            return Err(DriftError::InvalidConfiguration(
                "n_kernel_centers must be positive".to_string(),
            ));
        }
        if !(self.lambda_rd_max > 0.0 && self.lambda_rd_max < 1.0) {
            return Err(DriftError::InvalidConfiguration(format!(
                "lambda_rd_max must be in (0, 1), got {}",
                self.lambda_rd_max
            )));
        }
        self.bandwidth.validate()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
