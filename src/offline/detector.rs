use super::prediction::{DriftPrediction, FeatureReport};
use super::reference::{apply_update, prepare_reference, RESERVOIR_STREAM};
use crate::calibration::{permutation_null, reference_split_null, EmpiricalNull, NullDistribution, NullScheme, PValueMode};
use crate::config::{DetectorConfig, ReferenceUpdate};
use crate::correction::aggregate;
use crate::error::{Degeneracy, DriftError, Result};
use crate::sample::Sample;
use crate::snapshot::{CachedNull, DetectorSnapshot, FittedStatistic, SNAPSHOT_VERSION};
use crate::statistic::{
    classifier_test, learned_kernel_test, linear_asymptotic, FeatureKind, LsddStatistic, Method, MmdEstimator,
    MmdStatistic, Statistic, UnivariateStatistic,
};
use crate::utils::{counter_seed, stream_rng, Timer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const STATISTIC_STREAM: u64 = 1;
const PERMUTATION_STREAM: u64 = 2;

/// Fitted statistic plus the nulls cached against it
struct Calibration {
    statistic: Statistic,
    warnings: Vec<Degeneracy>,
    reference_nulls: RwLock<HashMap<usize, Arc<Vec<EmpiricalNull>>>>,
}

impl Calibration {
    fn new(statistic: Statistic, warnings: Vec<Degeneracy>) -> Self {
        Self {
            statistic,
            warnings,
            reference_nulls: RwLock::new(HashMap::new()),
        }
    }
}

/// Compares whole batches against a fixed reference sample
///
/// Calibration runs at construction and again lazily after the reference
/// changes. `predict` takes `&self` and may be called from several threads.
pub struct OfflineDetector {
    config: DetectorConfig,
    reference: Sample,
    n_seen: usize,
    calibration: RwLock<Option<Arc<Calibration>>>,
}

impl OfflineDetector {
    /// Preprocess and sub-sample the reference, then calibrate
    pub fn new(reference: Sample, config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let reference = prepare_reference(&config, &reference)?;
        let detector = Self {
            n_seen: reference.n_samples(),
            config,
            reference,
            calibration: RwLock::new(None),
        };
        detector.calibrate()?;
        Ok(detector)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Reference after preprocessing and sub-sampling
    pub fn reference(&self) -> &Sample {
        &self.reference
    }

    pub fn n_seen(&self) -> usize {
        self.n_seen
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.read().is_some()
    }

    /// Degeneracies met while fitting the current calibration
    pub fn warnings(&self) -> Vec<Degeneracy> {
        self.calibration
            .read()
            .as_ref()
            .map(|c| c.warnings.clone())
            .unwrap_or_default()
    }

    fn fit(&self) -> Result<Calibration> {
        let timer = Timer::start();
        tracing::info!(
            method = self.config.method.name(),
            n_reference = self.reference.n_samples(),
            n_features = self.reference.n_features(),
            "Calibrating drift detector"
        );
        let (statistic, warnings) = Statistic::fit(&self.config.method, &self.reference, &self.config.fit_context())?;
        tracing::info!(
            method = self.config.method.name(),
            warnings = warnings.len(),
            elapsed_ms = timer.elapsed_ms(),
            "Drift detector calibrated"
        );
        Ok(Calibration::new(statistic, warnings))
    }

    /// Fit the statistic to the current reference now
    ///
    /// Callers that want calibration off the serving path can invoke this
    /// after `update_reference` instead of letting the next `predict` do it.
    pub fn calibrate(&self) -> Result<()> {
        let calibration = Arc::new(self.fit()?);
        *self.calibration.write() = Some(calibration);
        Ok(())
    }

    fn fitted(&self) -> Result<Arc<Calibration>> {
        if let Some(c) = self.calibration.read().as_ref() {
            return Ok(Arc::clone(c));
        }
        let mut guard = self.calibration.write();
        if let Some(c) = guard.as_ref() {
            return Ok(Arc::clone(c));
        }
        let calibration = Arc::new(self.fit()?);
        *guard = Some(Arc::clone(&calibration));
        Ok(calibration)
    }

    fn preprocess(&self, batch: &Sample) -> Result<Sample> {
        match &self.config.preprocessor {
            Some(p) => p.transform(batch),
            None => Ok(batch.clone()),
        }
    }

    /// Test one batch against the reference
    pub fn predict(&self, batch: &Sample) -> Result<DriftPrediction> {
        let method = &self.config.method;
        if batch.is_empty() {
            return Err(DriftError::insufficient(method.name(), method.min_samples(), 0));
        }
        let x = self.preprocess(batch)?;
        x.check_features(self.reference.n_features())?;
        if x.n_samples() < method.min_samples() {
            return Err(DriftError::insufficient(method.name(), method.min_samples(), x.n_samples()));
        }

        let cal = self.fitted()?;
        let timer = Timer::start();
        let mut prediction = match &cal.statistic {
            Statistic::Mmd(s) => self.predict_mmd(&cal, s, &x)?,
            Statistic::Lsdd(s) => self.predict_lsdd(&cal, s, &x)?,
            Statistic::Univariate(s) => self.predict_univariate(&cal, s, &x)?,
            Statistic::Classifier { settings, factory } => {
                let seed = counter_seed(self.config.seed, STATISTIC_STREAM);
                let outcome = classifier_test(&self.reference, &x, settings, factory.as_ref(), seed)?;
                self.single(
                    &x,
                    outcome.statistic,
                    outcome.p_value,
                    outcome.threshold(self.config.alpha),
                    Vec::new(),
                )
            }
            Statistic::LearnedKernel { settings, projection } => {
                let seed = counter_seed(self.config.seed, STATISTIC_STREAM);
                let outcome = learned_kernel_test(
                    &self.reference,
                    &x,
                    settings,
                    projection.as_deref(),
                    self.config.n_permutations,
                    seed,
                )?;
                let distance_threshold = outcome.null.threshold(self.config.alpha);
                self.single(&x, outcome.statistic, outcome.p_value, distance_threshold, Vec::new())
            }
        };

        let mut warnings = cal.warnings.clone();
        warnings.append(&mut prediction.warnings);
        prediction.warnings = warnings;

        tracing::debug!(
            method = method.name(),
            n_test = x.n_samples(),
            statistic = prediction.statistic,
            p_value = prediction.p_value,
            drift = prediction.drift_detected,
            elapsed_ms = timer.elapsed_ms(),
            "Drift prediction"
        );
        Ok(prediction)
    }

    /// Decision for methods producing a single p-value
    fn single(
        &self,
        x: &Sample,
        statistic: f64,
        p_value: f64,
        distance_threshold: f64,
        warnings: Vec<Degeneracy>,
    ) -> DriftPrediction {
        DriftPrediction {
            drift_detected: p_value < self.config.alpha,
            statistic,
            p_value,
            threshold: self.config.alpha,
            distance_threshold,
            features: None,
            method: self.config.method.name().to_string(),
            n_reference: self.reference.n_samples(),
            n_test: x.n_samples(),
            warnings,
        }
    }

    /// Permutation null under the configured scheme
    ///
    /// Reference-only nulls depend on the test-batch size alone and are
    /// cached per size for the lifetime of the calibration.
    fn simulate_null<P, R>(
        &self,
        cal: &Calibration,
        n_test: usize,
        pooled: P,
        reference_only: R,
    ) -> Result<Arc<Vec<EmpiricalNull>>>
    where
        P: FnOnce(u64) -> Result<Vec<EmpiricalNull>>,
        R: FnOnce(u64) -> Result<Vec<EmpiricalNull>>,
    {
        let seed = counter_seed(self.config.seed, PERMUTATION_STREAM);
        match self.config.null_scheme {
            NullScheme::Pooled => Ok(Arc::new(pooled(seed)?)),
            NullScheme::ReferenceOnly => {
                if let Some(hit) = cal.reference_nulls.read().get(&n_test) {
                    return Ok(Arc::clone(hit));
                }
                let nulls = Arc::new(reference_only(seed)?);
                cal.reference_nulls.write().insert(n_test, Arc::clone(&nulls));
                tracing::debug!(n_test = n_test, "Cached reference-only null");
                Ok(nulls)
            }
        }
    }

    fn predict_mmd(&self, cal: &Calibration, s: &MmdStatistic, x: &Sample) -> Result<DriftPrediction> {
        let alpha = self.config.alpha;
        if s.estimator() == MmdEstimator::Linear && self.config.p_value_mode != PValueMode::Permutation {
            let terms = s.linear_terms(x);
            let statistic = terms.iter().sum::<f64>() / terms.len().max(1) as f64;
            let (p_value, std, warning) = linear_asymptotic(&terms);
            let threshold = NullDistribution::Normal { std }.threshold(alpha);
            return Ok(self.single(x, statistic, p_value, threshold, warning.into_iter().collect()));
        }

        let (n_ref, m, n_perm) = (self.reference.n_samples(), x.n_samples(), self.config.n_permutations);
        let statistic = s.compute(x);
        let nulls = self.simulate_null(
            cal,
            m,
            |seed| Ok(permutation_null(&s.pooled(x)?, n_ref, n_perm, seed)),
            |seed| reference_split_null(&s.reference_split(), m, s.min_samples(), n_perm, seed),
        )?;
        Ok(self.single(x, statistic, nulls[0].p_value(statistic), nulls[0].threshold(alpha), Vec::new()))
    }

    fn predict_lsdd(&self, cal: &Calibration, s: &LsddStatistic, x: &Sample) -> Result<DriftPrediction> {
        let (n_ref, m, n_perm) = (s.n_reference(), x.n_samples(), self.config.n_permutations);
        let statistic = s.compute(x);
        let nulls = self.simulate_null(
            cal,
            m,
            |seed| Ok(permutation_null(&s.pooled(x)?, n_ref, n_perm, seed)),
            |seed| reference_split_null(&s.reference_split(), m, 1, n_perm, seed),
        )?;
        let threshold = nulls[0].threshold(self.config.alpha);
        Ok(self.single(x, statistic, nulls[0].p_value(statistic), threshold, Vec::new()))
    }

    fn predict_univariate(&self, cal: &Calibration, s: &UnivariateStatistic, x: &Sample) -> Result<DriftPrediction> {
        let (n_ref, m, n_perm) = (self.reference.n_samples(), x.n_samples(), self.config.n_permutations);
        let (statistics, dofs) = s.compute(x)?;

        let nulls: Vec<NullDistribution> = if self.config.p_value_mode == PValueMode::Permutation {
            let simulated = self.simulate_null(
                cal,
                m,
                |seed| Ok(permutation_null(&s.pooled(x)?, n_ref, n_perm, seed)),
                |seed| reference_split_null(&s.reference_split(), m, 1, n_perm, seed),
            )?;
            simulated.iter().cloned().map(NullDistribution::Empirical).collect()
        } else {
            s.kinds()
                .iter()
                .zip(dofs.iter())
                .map(|(kind, &dof)| match kind {
                    FeatureKind::Continuous => NullDistribution::Kolmogorov {
                        n_reference: n_ref,
                        n_test: m,
                        alternative: s.alternative(),
                    },
                    FeatureKind::Categorical => NullDistribution::ChiSquared { dof },
                })
                .collect()
        };

        let constant = s.constant_features();
        let p_values: Vec<f64> = statistics
            .iter()
            .zip(nulls.iter())
            .enumerate()
            .map(|(j, (&stat, null))| if constant[j] { 1.0 } else { null.p_value(stat) })
            .collect();
        let outcome = aggregate(&p_values, self.config.alpha, self.config.correction)?;
        let distance_thresholds: Vec<f64> = nulls.iter().map(|n| n.threshold(outcome.threshold)).collect();

        let best = p_values
            .iter()
            .enumerate()
            .fold(0, |best, (j, &p)| if p < p_values[best] { j } else { best });

        Ok(DriftPrediction {
            drift_detected: outcome.drift_detected,
            statistic: statistics[best],
            p_value: p_values[best],
            threshold: outcome.threshold,
            distance_threshold: distance_thresholds[best],
            features: Some(FeatureReport {
                statistics,
                p_values,
                distance_thresholds,
                rejected: outcome.rejected,
            }),
            method: self.config.method.name().to_string(),
            n_reference: n_ref,
            n_test: m,
            warnings: Vec::new(),
        })
    }

    /// Replace the reference; calibration reruns on the next `predict` or `calibrate`
    pub fn update_reference(&mut self, reference: Sample) -> Result<()> {
        self.reference = prepare_reference(&self.config, &reference)?;
        self.n_seen = self.reference.n_samples();
        *self.calibration.get_mut() = None;
        tracing::info!(n_reference = self.reference.n_samples(), "Reference replaced, calibration invalidated");
        Ok(())
    }

    /// Fold an observed batch into the reference under the configured update policy
    ///
    /// Returns whether the reference changed.
    pub fn absorb(&mut self, batch: &Sample) -> Result<bool> {
        if self.config.reference_update == ReferenceUpdate::None || batch.is_empty() {
            return Ok(false);
        }
        let x = self.preprocess(batch)?;
        x.check_features(self.reference.n_features())?;
        let mut rng = stream_rng(counter_seed(self.config.seed, RESERVOIR_STREAM), self.n_seen as u64);
        let updated = apply_update(self.config.reference_update, &self.reference, &x, self.n_seen, &mut rng)?;
        self.n_seen += x.n_samples();
        match updated {
            Some(reference) => {
                self.reference = reference;
                *self.calibration.get_mut() = None;
                tracing::debug!(
                    n_reference = self.reference.n_samples(),
                    n_seen = self.n_seen,
                    "Reference updated from batch"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Capture the detector state
    pub fn snapshot(&self) -> DetectorSnapshot {
        let guard = self.calibration.read();
        let (fitted, warnings, mut reference_nulls) = match guard.as_ref() {
            Some(cal) => {
                let fitted = match &cal.statistic {
                    Statistic::Mmd(s) => FittedStatistic::Mmd {
                        kernel: s.kernel().clone(),
                    },
                    Statistic::Lsdd(s) => FittedStatistic::Lsdd {
                        model: s.model().clone(),
                        reference: s.reference().clone(),
                    },
                    Statistic::Univariate(_) => FittedStatistic::Univariate,
                    Statistic::Classifier { .. } | Statistic::LearnedKernel { .. } => FittedStatistic::Trained,
                };
                let nulls: Vec<CachedNull> = cal
                    .reference_nulls
                    .read()
                    .iter()
                    .map(|(&n_test, nulls)| CachedNull {
                        n_test,
                        nulls: nulls.as_ref().clone(),
                    })
                    .collect();
                (Some(fitted), cal.warnings.clone(), nulls)
            }
            None => (None, Vec::new(), Vec::new()),
        };
        reference_nulls.sort_by_key(|c| c.n_test);
        DetectorSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            reference: self.reference.clone(),
            n_seen: self.n_seen,
            fitted,
            warnings,
            reference_nulls,
        }
    }

    /// Rebuild a detector without re-running the expensive parts of calibration
    pub fn from_snapshot(snapshot: DetectorSnapshot) -> Result<Self> {
        let DetectorSnapshot {
            config,
            reference,
            n_seen,
            fitted,
            warnings,
            reference_nulls,
            ..
        } = snapshot;
        config.validate()?;
        if reference.is_empty() {
            return Err(DriftError::EmptyReference);
        }

        let statistic = match (fitted, &config.method) {
            (None, _) => None,
            (Some(FittedStatistic::Mmd { kernel }), Method::Mmd { estimator, .. }) => {
                Some(Statistic::Mmd(MmdStatistic::with_kernel(&reference, kernel, *estimator)))
            }
            (Some(FittedStatistic::Lsdd { model, reference: effective }), Method::Lsdd { .. }) => {
                effective.check_features(reference.n_features())?;
                Some(Statistic::Lsdd(LsddStatistic::from_model(model, &effective)))
            }
            (Some(FittedStatistic::Univariate), m) if m.is_per_feature() => {
                Some(Statistic::fit(m, &reference, &config.fit_context())?.0)
            }
            (Some(FittedStatistic::Trained), m)
                if matches!(m, Method::Classifier(_) | Method::LearnedKernel(_)) =>
            {
                Some(Statistic::fit(m, &reference, &config.fit_context())?.0)
            }
            (Some(_), m) => {
                return Err(DriftError::Serialization(format!(
                    "snapshot state does not match method {}",
                    m.name()
                )))
            }
        };

        let calibration = statistic.map(|statistic| {
            let cal = Calibration::new(statistic, warnings);
            {
                let mut cache = cal.reference_nulls.write();
                for cached in reference_nulls {
                    cache.insert(cached.n_test, Arc::new(cached.nulls));
                }
            }
            Arc::new(cal)
        });

        Ok(Self {
            config,
            reference,
            n_seen,
            calibration: RwLock::new(calibration),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::NullScheme;
    use crate::kernel::Bandwidth;
    use crate::statistic::Alternative;
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
    fn test_empty_reference() {
        let empty = Sample::new(Array2::zeros((0, 2))).unwrap();
        let err = OfflineDetector::new(empty, DetectorConfig::default()).err().unwrap();
        assert!(matches!(err, DriftError::EmptyReference));
    }

    #[test]
    fn test_invalid_configuration() {
        let reference = normal_sample(20, 1, 0.0, 1);
        let err = OfflineDetector::new(reference, DetectorConfig::default().with_alpha(2.0))
            .err()
            .unwrap();
        assert!(matches!(err, DriftError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_shape_mismatch() {
        let detector = OfflineDetector::new(normal_sample(50, 2, 0.0, 1), DetectorConfig::new(Method::ks())).unwrap();
        let err = detector.predict(&normal_sample(10, 3, 0.0, 2)).unwrap_err();
        assert!(matches!(err, DriftError::InvalidInputShape { .. }));
    }

    #[test]
    fn test_mmd_detects_shift() {
        let config = DetectorConfig::new(Method::mmd()).with_permutations(100).with_seed(4);
        let detector = OfflineDetector::new(normal_sample(100, 2, 0.0, 1), config).unwrap();
        let shifted = detector.predict(&normal_sample(100, 2, 1.0, 2)).unwrap();
        assert!(shifted.drift_detected);
        assert!(shifted.statistic > shifted.distance_threshold);
        assert_eq!(shifted.threshold, 0.05);
        assert_eq!(shifted.method, "mmd");
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let config = DetectorConfig::new(Method::mmd()).with_seed(9);
        let detector = OfflineDetector::new(normal_sample(60, 2, 0.0, 1), config).unwrap();
        let batch = normal_sample(60, 2, 0.2, 2);
        let a = detector.predict(&batch).unwrap();
        let b = detector.predict(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reference_only_nulls_are_cached() {
        let config = DetectorConfig::new(Method::mmd())
            .with_null_scheme(NullScheme::ReferenceOnly)
            .with_seed(2);
        let detector = OfflineDetector::new(normal_sample(120, 1, 0.0, 1), config).unwrap();
        let first = detector.predict(&normal_sample(30, 1, 0.0, 2)).unwrap();
        assert!(first.p_value > 0.0);
        let snapshot = detector.snapshot();
        assert_eq!(snapshot.reference_nulls.len(), 1);
        assert_eq!(snapshot.reference_nulls[0].n_test, 30);
        let err = detector.predict(&normal_sample(119, 1, 0.0, 3)).unwrap_err();
        assert!(matches!(err, DriftError::InsufficientSamples { .. }));
    }

    #[test]
    fn test_linear_mmd_asymptotic() {
        let method = Method::Mmd {
            estimator: MmdEstimator::Linear,
            bandwidth: Bandwidth::Fixed(vec![1.0]),
        };
        let detector = OfflineDetector::new(normal_sample(400, 1, 0.0, 1), DetectorConfig::new(method)).unwrap();
        let same = detector.predict(&normal_sample(400, 1, 0.0, 2)).unwrap();
        let shifted = detector.predict(&normal_sample(400, 1, 1.5, 3)).unwrap();
        assert!(shifted.p_value < same.p_value);
        assert!(shifted.drift_detected);
    }

    #[test]
    fn test_constant_feature_has_unit_p_value() {
        let mut data = normal_sample(200, 2, 0.0, 1).as_array().clone();
        data.column_mut(1).fill(5.0);
        let reference = Sample::new(data).unwrap();
        let detector = OfflineDetector::new(reference, DetectorConfig::new(Method::ks())).unwrap();
        let prediction = detector.predict(&normal_sample(100, 2, 0.0, 2)).unwrap();
        let features = prediction.features.unwrap();
        assert_eq!(features.p_values[1], 1.0);
        assert!(prediction.warnings.iter().any(|w| w.feature == Some(1)));
    }

    #[test]
    fn test_update_reference_invalidates_calibration() {
        let mut detector = OfflineDetector::new(normal_sample(50, 1, 0.0, 1), DetectorConfig::new(Method::ks())).unwrap();
        assert!(detector.is_calibrated());
        detector.update_reference(normal_sample(80, 1, 3.0, 2)).unwrap();
        assert!(!detector.is_calibrated());
        let prediction = detector.predict(&normal_sample(80, 1, 3.0, 3)).unwrap();
        assert_eq!(prediction.n_reference, 80);
        assert!(detector.is_calibrated());
    }

    #[test]
    fn test_absorb_last() {
        let config = DetectorConfig::new(Method::Ks {
            alternative: Alternative::TwoSided,
        })
        .with_reference_update(ReferenceUpdate::Last(60));
        let mut detector = OfflineDetector::new(normal_sample(50, 1, 0.0, 1), config).unwrap();
        assert!(detector.absorb(&normal_sample(30, 1, 0.0, 2)).unwrap());
        assert_eq!(detector.reference().n_samples(), 60);
        assert_eq!(detector.n_seen(), 80);
        assert!(!detector.is_calibrated());
    }

    #[test]
    fn test_snapshot_restores_predictions() {
        let config = DetectorConfig::new(Method::lsdd()).with_seed(5);
        let detector = OfflineDetector::new(normal_sample(80, 2, 0.0, 1), config).unwrap();
        let batch = normal_sample(40, 2, 0.5, 2);
        let before = detector.predict(&batch).unwrap();

        let json = detector.snapshot().to_json().unwrap();
        let restored = OfflineDetector::from_snapshot(DetectorSnapshot::from_json(&json).unwrap()).unwrap();
        assert!(restored.is_calibrated());
        let after = restored.predict(&batch).unwrap();
        assert!((before.p_value - after.p_value).abs() <= 0.02);
        assert!((before.statistic - after.statistic).abs() < 1e-9);
    }
}
