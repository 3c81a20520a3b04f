//! Sequential drift detection over a stream
//!
//! An [`OnlineDetector`] compares a sliding window of the most recent points
//! against a fixed reference. Thresholds for each window position are
//! simulated once, at construction, from bootstrap no-drift streams drawn out
//! of the reference, so that the per-step false positive rate matches the
//! configured [`ErrorControl`](crate::config::ErrorControl) target.
//!
//! Once the statistic crosses its threshold the detector latches: every later
//! prediction reports drift until [`OnlineDetector::reset`] is called.

mod lsdd;
mod mmd;
mod thresholds;
mod window;

pub use window::{Push, RingWindow};

use crate::config::{OnlineConfig, OnlineMethod};
use crate::error::{Degeneracy, DriftError, Result};
use crate::sample::Sample;
use crate::snapshot::{OnlineFitted, OnlineSnapshot, SNAPSHOT_VERSION};
use crate::utils::{counter_seed, stream_rng, Timer};
use lsdd::LsddOnline;
use mmd::MmdOnline;
use ndarray::ArrayView1;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

const THRESHOLD_STREAM: u64 = 1;
const RESET_STREAM: u64 = 2;

/// Outcome of ingesting one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlinePrediction {
    /// Latched: stays `true` from the first alarm until `reset`
    pub drift_detected: bool,
    /// Step at which drift was first declared
    pub declared_at: Option<u64>,
    /// `None` while the MMD window is still filling
    pub statistic: Option<f64>,
    pub threshold: f64,
    /// Points ingested since construction or the last reset
    pub time: u64,
}

#[derive(Debug, Clone)]
enum Engine {
    Mmd(MmdOnline),
    Lsdd(LsddOnline),
}

impl Engine {
    fn thresholds(&self) -> &[f64] {
        match self {
            Engine::Mmd(e) => e.thresholds(),
            Engine::Lsdd(e) => e.thresholds(),
        }
    }

    fn threshold_at(&self, t: u64) -> f64 {
        match self {
            Engine::Mmd(e) => e.threshold_at(t),
            Engine::Lsdd(e) => e.threshold_at(t),
        }
    }

    fn start(&mut self, rng: &mut Xoshiro256PlusPlus) -> Option<Degeneracy> {
        match self {
            Engine::Mmd(e) => {
                e.start(rng);
                None
            }
            Engine::Lsdd(e) => e.start(rng),
        }
    }

    fn ingest(&mut self, point: ArrayView1<f64>) -> Option<f64> {
        match self {
            Engine::Mmd(e) => e.ingest(point),
            Engine::Lsdd(e) => Some(e.ingest(point)),
        }
    }

    fn fitted(&self) -> OnlineFitted {
        match self {
            Engine::Mmd(e) => OnlineFitted::Mmd {
                kernel: e.kernel().clone(),
            },
            Engine::Lsdd(e) => OnlineFitted::Lsdd {
                model: e.model().clone(),
                reference: e.reference().clone(),
            },
        }
    }
}

/// Sliding-window detector with latched drift declaration
///
/// The window is owned by the detector; independent streams need
/// independent detectors.
#[derive(Debug)]
pub struct OnlineDetector {
    config: OnlineConfig,
    reference: Sample,
    engine: Engine,
    warnings: Vec<Degeneracy>,
    t: u64,
    declared_at: Option<u64>,
    reset_count: u64,
}

impl OnlineDetector {
    /// Preprocess the reference, simulate thresholds and start the stream
    pub fn new(reference: Sample, config: OnlineConfig) -> Result<Self> {
        config.validate()?;
        if reference.is_empty() {
            return Err(DriftError::EmptyReference);
        }
        let reference = match &config.preprocessor {
            Some(p) => p.transform(&reference)?,
            None => reference,
        };
        let (engine, warnings) = Self::fit_engine(&reference, &config)?;
        let mut detector = Self {
            config,
            reference,
            engine,
            warnings,
            t: 0,
            declared_at: None,
            reset_count: 0,
        };
        detector.restart();
        Ok(detector)
    }

    fn fit_engine(reference: &Sample, config: &OnlineConfig) -> Result<(Engine, Vec<Degeneracy>)> {
        let timer = Timer::start();
        let seed = counter_seed(config.seed, THRESHOLD_STREAM);
        let fpr = config.error_control.fpr();
        tracing::info!(
            method = ?config.method,
            n_reference = reference.n_samples(),
            window_size = config.window_size,
            n_bootstraps = config.n_bootstraps,
            fpr = fpr,
            "Configuring online thresholds"
        );
        let (engine, warnings) = match config.method {
            OnlineMethod::Mmd => {
                let (kernel, bw_warning) = config.bandwidth.resolve(reference.view())?;
                let (engine, mut warnings) =
                    MmdOnline::fit(reference, kernel, config.window_size, config.n_bootstraps, fpr, seed)?;
                warnings.extend(bw_warning);
                (Engine::Mmd(engine), warnings)
            }
            OnlineMethod::Lsdd => {
                let (engine, warnings) = LsddOnline::fit(
                    reference,
                    &config.bandwidth,
                    config.n_kernel_centers,
                    config.window_size,
                    config.n_bootstraps,
                    fpr,
                    config.lambda_rd_max,
                    seed,
                )?;
                (Engine::Lsdd(engine), warnings)
            }
        };
        tracing::info!(
            method = ?config.method,
            warnings = warnings.len(),
            elapsed_ms = timer.elapsed_ms(),
            "Online thresholds configured"
        );
        Ok((engine, warnings))
    }

    /// Fresh reference draw for the current reset count
    fn restart(&mut self) {
        self.t = 0;
        self.declared_at = None;
        let mut rng = stream_rng(counter_seed(self.config.seed, RESET_STREAM), self.reset_count);
        if let Some(warning) = self.engine.start(&mut rng) {
            self.warnings.push(warning);
        }
    }

    pub fn config(&self) -> &OnlineConfig {
        &self.config
    }

    /// Reference after preprocessing
    pub fn reference(&self) -> &Sample {
        &self.reference
    }

    /// Points ingested since construction or the last reset
    pub fn time(&self) -> u64 {
        self.t
    }

    pub fn declared_at(&self) -> Option<u64> {
        self.declared_at
    }

    pub fn drift_detected(&self) -> bool {
        self.declared_at.is_some()
    }

    /// Thresholds for the first `W` window positions
    pub fn thresholds(&self) -> &[f64] {
        self.engine.thresholds()
    }

    pub fn warnings(&self) -> &[Degeneracy] {
        &self.warnings
    }

    /// Add one point to the window and test it
    pub fn ingest(&mut self, point: ArrayView1<f64>) -> Result<OnlinePrediction> {
        let sample = Sample::from_point(point)?;
        let sample = match &self.config.preprocessor {
            Some(p) => p.transform(&sample)?,
            None => sample,
        };
        sample.check_features(self.reference.n_features())?;
        if sample.n_samples() != 1 {
            return Err(DriftError::shape("1 row after preprocessing", format!("{} rows", sample.n_samples())));
        }

        let statistic = self.engine.ingest(sample.row(0));
        self.t += 1;
        let threshold = self.engine.threshold_at(self.t);

        if let Some(stat) = statistic {
            if self.declared_at.is_none() && stat > threshold {
                self.declared_at = Some(self.t);
                tracing::warn!(
                    time = self.t,
                    statistic = stat,
                    threshold = threshold,
                    "Online drift declared"
                );
            }
        }

        Ok(OnlinePrediction {
            drift_detected: self.declared_at.is_some(),
            declared_at: self.declared_at,
            statistic,
            threshold,
            time: self.t,
        })
    }

    /// Ingest a batch of points in order, returning one prediction per row
    pub fn ingest_batch(&mut self, batch: &Sample) -> Result<Vec<OnlinePrediction>> {
        (0..batch.n_samples()).map(|i| self.ingest(batch.row(i))).collect()
    }

    /// Clear the latch and the window and draw a new reference subset
    pub fn reset(&mut self) {
        self.reset_count += 1;
        self.restart();
        tracing::info!(reset_count = self.reset_count, "Online detector reset");
    }

    /// Replace the reference and re-simulate the thresholds
    pub fn update_reference(&mut self, reference: Sample) -> Result<()> {
        if reference.is_empty() {
            return Err(DriftError::EmptyReference);
        }
        let reference = match &self.config.preprocessor {
            Some(p) => p.transform(&reference)?,
            None => reference,
        };
        let (engine, warnings) = Self::fit_engine(&reference, &self.config)?;
        self.reference = reference;
        self.engine = engine;
        self.warnings = warnings;
        self.reset_count = 0;
        self.restart();
        Ok(())
    }

    /// Capture the fitted state; the current window is not included
    pub fn snapshot(&self) -> OnlineSnapshot {
        OnlineSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            reference: self.reference.clone(),
            fitted: self.engine.fitted(),
            thresholds: self.engine.thresholds().to_vec(),
            warnings: self.warnings.clone(),
            reset_count: self.reset_count,
        }
    }

    /// Rebuild a detector without re-simulating thresholds
    ///
    /// The restored detector starts a fresh stream at `t = 0`.
    pub fn from_snapshot(snapshot: OnlineSnapshot) -> Result<Self> {
        let OnlineSnapshot {
            config,
            reference,
            fitted,
            thresholds,
            warnings,
            reset_count,
            ..
        } = snapshot;
        config.validate()?;
        if reference.is_empty() {
            return Err(DriftError::EmptyReference);
        }
        if thresholds.len() != config.window_size {
            return Err(DriftError::Serialization(format!(
                "expected {} thresholds, got {}",
                config.window_size,
                thresholds.len()
            )));
        }
        let engine = match (fitted, config.method) {
            (OnlineFitted::Mmd { kernel }, OnlineMethod::Mmd) => {
                Engine::Mmd(MmdOnline::from_parts(&reference, kernel, config.window_size, thresholds))
            }
            (OnlineFitted::Lsdd { model, reference: effective }, OnlineMethod::Lsdd) => {
                effective.check_features(reference.n_features())?;
                Engine::Lsdd(LsddOnline::from_parts(model, &effective, config.window_size, thresholds))
            }
            (_, method) => {
                return Err(DriftError::Serialization(format!(
                    "snapshot state does not match method {:?}",
                    method
                )))
            }
        };
        let mut detector = Self {
            config,
            reference,
            engine,
            warnings,
            t: 0,
            declared_at: None,
            reset_count,
        };
        detector.restart();
        Ok(detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn normal_sample(n: usize, d: usize, shift: f64, seed: u64) -> Sample {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let data = Array2::from_shape_fn((n, d), |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            z + shift
        });
        Sample::new(data).unwrap()
    }

    fn config(method: OnlineMethod) -> OnlineConfig {
        OnlineConfig::new(method)
            .with_window_size(10)
            .with_bootstraps(300)
            .with_expected_run_time(50.0)
            .with_seed(11)
    }

    #[test]
    fn test_empty_reference() {
        let reference = Sample::new(Array2::zeros((0, 2))).unwrap();
        let err = OnlineDetector::new(reference, config(OnlineMethod::Mmd)).unwrap_err();
        assert!(matches!(err, DriftError::EmptyReference));
    }

    #[test]
    fn test_mmd_statistic_waits_for_full_window() {
        let mut detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Mmd)).unwrap();
        let stream = normal_sample(10, 2, 0.0, 2);
        for i in 0..9 {
            let pred = detector.ingest(stream.row(i)).unwrap();
            assert!(pred.statistic.is_none());
            assert!(!pred.drift_detected);
        }
        let pred = detector.ingest(stream.row(9)).unwrap();
        assert!(pred.statistic.is_some());
        assert_eq!(pred.time, 10);
    }

    #[test]
    fn test_lsdd_statistic_from_first_point() {
        let mut detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Lsdd)).unwrap();
        let pred = detector.ingest(array![0.1, -0.2].view()).unwrap();
        assert!(pred.statistic.is_some());
        assert_eq!(pred.time, 1);
    }

    #[test]
    fn test_latch_holds_until_reset() {
        let mut detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Mmd)).unwrap();
        let shifted = normal_sample(60, 2, 4.0, 3);
        let preds = detector.ingest_batch(&shifted).unwrap();
        let first = preds.iter().position(|p| p.drift_detected).unwrap();
        let declared = preds[first].declared_at;
        assert_eq!(declared, Some(first as u64 + 1));
        assert!(preds[first..].iter().all(|p| p.drift_detected && p.declared_at == declared));

        detector.reset();
        assert_eq!(detector.time(), 0);
        assert!(!detector.drift_detected());
    }

    #[test]
    fn test_rejects_bad_points() {
        let mut detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Mmd)).unwrap();
        assert!(detector.ingest(array![1.0, f64::NAN].view()).is_err());
        assert!(matches!(
            detector.ingest(array![1.0, 2.0, 3.0].view()),
            Err(DriftError::InvalidInputShape { .. })
        ));
        assert_eq!(detector.time(), 0);
    }

    #[test]
    fn test_snapshot_round_trip_keeps_thresholds() {
        let detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Lsdd)).unwrap();
        let json = detector.snapshot().to_json().unwrap();
        let restored = OnlineDetector::from_snapshot(OnlineSnapshot::from_json(&json).unwrap()).unwrap();
        assert_eq!(restored.thresholds().len(), detector.thresholds().len());
        for (a, b) in restored.thresholds().iter().zip(detector.thresholds()) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
        }
        assert_eq!(restored.time(), 0);
    }

    #[test]
    fn test_snapshot_method_mismatch() {
        let detector = OnlineDetector::new(normal_sample(200, 2, 0.0, 1), config(OnlineMethod::Mmd)).unwrap();
        let mut snapshot = detector.snapshot();
        snapshot.config.method = OnlineMethod::Lsdd;
        assert!(matches!(
            OnlineDetector::from_snapshot(snapshot),
            Err(DriftError::Serialization(_))
        ));
    }
}
