//! MMD test with a kernel trained on a held-out split
//!
//! The deep kernel's bandwidths and mixing weight are fitted on a training
//! split by maximising the test-power proxy `MMD²_u / sqrt(V̂ + 1e-8)`; the
//! permutation test then runs on the remaining rows only.

use super::mmd::{GramSplit, MmdEstimator};
use super::SplitStatistic;
use crate::calibration::{permutation_null, EmpiricalNull};
use crate::error::{DriftError, Result};
use crate::kernel::{median_heuristic, squared_distances, DeepKernel, GaussianRbf};
use crate::preprocess::Preprocessor;
use crate::sample::Sample;
use crate::utils::{counter_seed, seeded_rng};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const VARIANCE_FLOOR: f64 = 1e-8;
const FINITE_DIFFERENCE_STEP: f64 = 1e-3;

fn default_train_size() -> f64 {
    0.75
}

fn default_epochs() -> usize {
    25
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_eps() -> Option<f64> {
    Some(0.1)
}

/// Training settings of the learned-kernel test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedKernelSettings {
    /// Fraction of each sample used to train the kernel
    #[serde(default = "default_train_size")]
    pub train_size: f64,
    /// Gradient-ascent steps
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Initial weight of the raw-feature kernel; `None` drops that component
    #[serde(default = "default_eps")]
    pub eps: Option<f64>,
}

impl Default for LearnedKernelSettings {
    fn default() -> Self {
        Self {
            train_size: default_train_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            eps: default_eps(),
        }
    }
}

impl LearnedKernelSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.train_size > 0.0 && self.train_size < 1.0) {
            return Err(DriftError::InvalidConfiguration(format!(
                "train_size must be in (0, 1), got {}",
                self.train_size
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(DriftError::InvalidConfiguration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(eps) = self.eps {
            if !(eps > 0.0 && eps < 1.0) {
                return Err(DriftError::InvalidConfiguration(format!(
                    "eps must be in (0, 1), got {}",
                    eps
                )));
            }
        }
        Ok(())
    }
}

/// Result of one learned-kernel test
#[derive(Debug, Clone)]
pub struct LearnedKernelOutcome {
    /// Unbiased MMD² on the held-out rows
    pub statistic: f64,
    pub p_value: f64,
    /// Permutation null on the held-out rows
    pub null: EmpiricalNull,
    /// Trained kernel
    pub kernel: DeepKernel,
    pub n_train: usize,
    pub n_held_out: usize,
}

/// `MMD²_u / sqrt(V̂ + floor)` for a Gram matrix over `n` x-rows followed by `n` y-rows
pub fn power_objective(gram: ArrayView2<f64>, n: usize) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let h = |i: usize, j: usize| gram[[i, j]] + gram[[n + i, n + j]] - gram[[i, n + j]] - gram[[j, n + i]];
    let mut row_sums = vec![0.0; n];
    let mut trace = 0.0;
    for (i, row_sum) in row_sums.iter_mut().enumerate() {
        for j in 0..n {
            *row_sum += h(i, j);
        }
        trace += h(i, i);
    }
    let total: f64 = row_sums.iter().sum();
    let nf = n as f64;
    let mmd2 = (total - trace) / (nf * (nf - 1.0));
    let var = 4.0 / nf.powi(3) * row_sums.iter().map(|r| r * r).sum::<f64>() - 4.0 / nf.powi(4) * total * total;
    mmd2 / (var.max(0.0) + VARIANCE_FLOOR).sqrt()
}

fn project(projection: Option<&dyn Preprocessor>, sample: &Sample) -> Result<Sample> {
    match projection {
        Some(p) => p.transform(sample),
        None => Ok(sample.clone()),
    }
}

fn bandwidth_from(x: ArrayView2<f64>) -> Result<GaussianRbf> {
    let sigma = median_heuristic(x);
    GaussianRbf::new(vec![if sigma > 0.0 { sigma } else { 1.0 }])
}

/// Fit the kernel on the training rows by finite-difference gradient ascent
fn train_kernel(
    initial: DeepKernel,
    projected: &Array2<f64>,
    raw: &Array2<f64>,
    n_per_group: usize,
    settings: &LearnedKernelSettings,
) -> DeepKernel {
    let proj_sq = squared_distances(projected.view(), projected.view());
    let raw_sq = initial
        .kernel_b()
        .map(|_| squared_distances(raw.view(), raw.view()));
    let objective = |kernel: &DeepKernel| {
        let gram = kernel.from_squared(&proj_sq, raw_sq.as_ref());
        power_objective(gram.view(), n_per_group)
    };

    let mut params = initial.parameters();
    let mut best = (objective(&initial), initial.clone());
    for epoch in 0..settings.epochs {
        let grad: Vec<f64> = (0..params.len())
            .map(|k| {
                let mut up = params.clone();
                let mut down = params.clone();
                up[k] += FINITE_DIFFERENCE_STEP;
                down[k] -= FINITE_DIFFERENCE_STEP;
                (objective(&initial.with_parameters(&up)) - objective(&initial.with_parameters(&down)))
                    / (2.0 * FINITE_DIFFERENCE_STEP)
            })
            .collect();
        for (p, g) in params.iter_mut().zip(grad.iter()) {
            *p += settings.learning_rate * g;
        }
        let candidate = initial.with_parameters(&params);
        let value = objective(&candidate);
        if value.is_finite() && value > best.0 {
            best = (value, candidate);
        }
        tracing::trace!(epoch = epoch, objective = value, "Kernel training step");
    }
    tracing::debug!(objective = best.0, eps = best.1.eps(), "Trained deep kernel");
    best.1
}

/// Learned-kernel two-sample test
pub fn learned_kernel_test(
    reference: &Sample,
    test: &Sample,
    settings: &LearnedKernelSettings,
    projection: Option<&dyn Preprocessor>,
    n_permutations: usize,
    seed: u64,
) -> Result<LearnedKernelOutcome> {
    let (n_ref, n_test) = (reference.n_samples(), test.n_samples());
    if n_ref < 4 || n_test < 4 {
        return Err(DriftError::insufficient("learned kernel", 4, n_ref.min(n_test)));
    }

    let mut rng = seeded_rng(seed);
    let split = |n: usize, rng: &mut rand_xoshiro::Xoshiro256PlusPlus| {
        let mut idx: Vec<usize> = (0..n).collect();
        idx.shuffle(rng);
        let n_train = ((settings.train_size * n as f64).round() as usize).clamp(2, n - 2);
        let held = idx.split_off(n_train);
        (idx, held)
    };
    let (ref_train, ref_held) = split(n_ref, &mut rng);
    let (test_train, test_held) = split(n_test, &mut rng);

    // Equal group sizes for the variance estimate
    let n_pair = ref_train.len().min(test_train.len());
    let train_raw = concatenate(
        Axis(0),
        &[
            reference.select(&ref_train[..n_pair]).view(),
            test.select(&test_train[..n_pair]).view(),
        ],
    )?;
    let train_raw = Sample::new(train_raw)?;
    let train_proj = project(projection, &train_raw)?;

    let kernel_b = match settings.eps {
        Some(_) => Some(bandwidth_from(train_raw.view())?),
        None => None,
    };
    let initial = DeepKernel::new(
        bandwidth_from(train_proj.view())?,
        kernel_b,
        settings.eps.unwrap_or(0.0),
    )?;
    let kernel = train_kernel(
        initial,
        train_proj.as_array(),
        train_raw.as_array(),
        n_pair,
        settings,
    );

    let held_raw = reference.select(&ref_held).concat(&test.select(&test_held))?;
    let held_proj = project(projection, &held_raw)?;
    let gram = kernel.matrix(
        held_proj.view(),
        held_proj.view(),
        held_raw.view(),
        held_raw.view(),
    );
    let evaluator = GramSplit::new(Cow::Owned(gram), MmdEstimator::Unbiased);
    let n_x = ref_held.len();
    let x: Vec<usize> = (0..n_x).collect();
    let y: Vec<usize> = (n_x..held_raw.n_samples()).collect();
    let statistic = evaluator.evaluate(&x, &y)[0];
    let null = permutation_null(&evaluator, n_x, n_permutations, counter_seed(seed, 1))
        .into_iter()
        .next()
        .unwrap_or_else(|| EmpiricalNull::from_values(Vec::new()));
    let p_value = null.p_value(statistic);

    Ok(LearnedKernelOutcome {
        statistic,
        p_value,
        null,
        kernel,
        n_train: 2 * n_pair,
        n_held_out: held_raw.n_samples(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::RandomProjection;
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
    fn test_power_objective_prefers_separated_groups() {
        let same = normal_sample(40, 1, 0.0, 1).concat(&normal_sample(40, 1, 0.0, 2)).unwrap();
        let apart = normal_sample(40, 1, 0.0, 1).concat(&normal_sample(40, 1, 2.0, 2)).unwrap();
        let k = GaussianRbf::new(vec![1.0]).unwrap();
        let j_same = power_objective(k.matrix(same.view(), same.view()).view(), 40);
        let j_apart = power_objective(k.matrix(apart.view(), apart.view()).view(), 40);
        assert!(j_apart > j_same);
    }

    #[test]
    fn test_training_does_not_decrease_objective() {
        let x = normal_sample(30, 2, 0.0, 3).concat(&normal_sample(30, 2, 1.0, 4)).unwrap();
        let initial = DeepKernel::new(
            GaussianRbf::new(vec![5.0]).unwrap(),
            Some(GaussianRbf::new(vec![5.0]).unwrap()),
            0.5,
        )
        .unwrap();
        let proj_sq = squared_distances(x.view(), x.view());
        let before = power_objective(initial.from_squared(&proj_sq, Some(&proj_sq)).view(), 30);
        let trained = train_kernel(initial, x.as_array(), x.as_array(), 30, &LearnedKernelSettings::default());
        let after = power_objective(trained.from_squared(&proj_sq, Some(&proj_sq)).view(), 30);
        assert!(after >= before);
    }

    #[test]
    fn test_learned_kernel_detects_shift() {
        let reference = normal_sample(120, 3, 0.0, 5);
        let test = normal_sample(120, 3, 1.0, 6);
        let projection = RandomProjection::new(3, 2, 0).unwrap();
        let outcome = learned_kernel_test(
            &reference,
            &test,
            &LearnedKernelSettings::default(),
            Some(&projection),
            100,
            42,
        )
        .unwrap();
        assert!(outcome.p_value <= 0.05);
        assert_eq!(outcome.n_held_out, 60);
        assert_eq!(outcome.null.len(), 100);
    }

    #[test]
    fn test_too_few_rows() {
        let reference = normal_sample(3, 1, 0.0, 1);
        let test = normal_sample(10, 1, 0.0, 2);
        let err = learned_kernel_test(&reference, &test, &LearnedKernelSettings::default(), None, 10, 0)
            .unwrap_err();
        assert!(matches!(err, DriftError::InsufficientSamples { .. }));
    }
}
