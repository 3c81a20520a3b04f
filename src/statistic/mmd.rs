//! Kernel maximum mean discrepancy

use super::SplitStatistic;
use crate::error::{Degeneracy, DegeneracyKind, Result};
use crate::kernel::{Bandwidth, GaussianRbf};
use crate::sample::Sample;
use crate::stats::normal_sf;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

/// MMD² estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmdEstimator {
    /// V-statistic including the diagonal terms
    Biased,
    /// U-statistic excluding the diagonal terms
    #[default]
    Unbiased,
    /// Linear-time estimator over disjoint pairs
    Linear,
}

impl MmdEstimator {
    /// Minimum rows needed in each sample
    pub fn min_samples(&self) -> usize {
        match self {
            MmdEstimator::Biased => 1,
            MmdEstimator::Unbiased | MmdEstimator::Linear => 2,
        }
    }
}

fn block_sum(gram: ArrayView2<f64>, a: &[usize], b: &[usize]) -> f64 {
    a.iter()
        .map(|&i| {
            let row = gram.row(i);
            b.iter().map(|&j| row[j]).sum::<f64>()
        })
        .sum()
}

fn diag_sum(gram: ArrayView2<f64>, a: &[usize]) -> f64 {
    a.iter().map(|&i| gram[[i, i]]).sum()
}

fn paired_terms(x: &[usize], y: &[usize], k: impl Fn(usize, usize) -> f64) -> Vec<f64> {
    let pairs = x.len().min(y.len()) / 2;
    (0..pairs)
        .map(|i| {
            let (x1, x2) = (x[2 * i], x[2 * i + 1]);
            let (y1, y2) = (y[2 * i], y[2 * i + 1]);
            k(x1, x2) + k(y1, y2) - k(x1, y2) - k(x2, y1)
        })
        .collect()
}

fn mean_or_zero(terms: &[f64]) -> f64 {
    if terms.is_empty() {
        0.0
    } else {
        terms.iter().sum::<f64>() / terms.len() as f64
    }
}

/// Terms `h_i` of the linear-time estimator over pairs `(x_{2i}, x_{2i+1})`, `(y_{2i}, y_{2i+1})`
pub fn linear_terms(gram: ArrayView2<f64>, x: &[usize], y: &[usize]) -> Vec<f64> {
    paired_terms(x, y, |i, j| gram[[i, j]])
}

/// MMD² between the rows `x` and `y` of a pooled Gram matrix
///
/// `pooled_total` is the sum of every entry of `gram`; when `x` and `y`
/// partition the rows it lets the cross term be recovered without a third
/// block sum.
pub fn mmd2_from_gram(
    gram: ArrayView2<f64>,
    x: &[usize],
    y: &[usize],
    estimator: MmdEstimator,
    pooled_total: Option<f64>,
) -> f64 {
    if estimator == MmdEstimator::Linear {
        return mean_or_zero(&linear_terms(gram, x, y));
    }

    let n = x.len() as f64;
    let m = y.len() as f64;
    let s_xx = block_sum(gram, x, x);
    let s_yy = block_sum(gram, y, y);
    let s_xy = match pooled_total {
        Some(total) if x.len() + y.len() == gram.nrows() => 0.5 * (total - s_xx - s_yy),
        _ => block_sum(gram, x, y),
    };

    match estimator {
        MmdEstimator::Biased => s_xx / (n * n) + s_yy / (m * m) - 2.0 * s_xy / (n * m),
        _ => {
            let d_x = diag_sum(gram, x);
            let d_y = diag_sum(gram, y);
            (s_xx - d_x) / (n * (n - 1.0)) + (s_yy - d_y) / (m * (m - 1.0)) - 2.0 * s_xy / (n * m)
        }
    }
}

/// Asymptotic p-value of the linear-time estimator and the null standard deviation
///
/// Under H0 the mean of the `h` terms is approximately normal with mean zero.
pub fn linear_asymptotic(terms: &[f64]) -> (f64, f64, Option<Degeneracy>) {
    let k = terms.len() as f64;
    let mean = terms.iter().sum::<f64>() / k;
    let var = terms.iter().map(|h| (h - mean).powi(2)).sum::<f64>() / (k - 1.0).max(1.0);
    let std = (var / k).sqrt();
    if std <= 0.0 || !std.is_finite() {
        let warning = Degeneracy::new(
            DegeneracyKind::ZeroNullVariance,
            "linear-time MMD terms have zero variance",
        );
        let p = if mean > 0.0 { 0.0 } else { 1.0 };
        return (p, 0.0, Some(warning));
    }
    (normal_sf(mean / std), std, None)
}

/// Pooled Gram matrix evaluated on index splits
#[derive(Debug, Clone)]
pub struct GramSplit<'a> {
    gram: Cow<'a, Array2<f64>>,
    estimator: MmdEstimator,
    total: f64,
}

impl<'a> GramSplit<'a> {
    pub fn new(gram: Cow<'a, Array2<f64>>, estimator: MmdEstimator) -> Self {
        let total = gram.sum();
        Self {
            gram,
            estimator,
            total,
        }
    }

    pub fn gram(&self) -> ArrayView2<'_, f64> {
        self.gram.view()
    }
}

impl SplitStatistic for GramSplit<'_> {
    fn n_rows(&self) -> usize {
        self.gram.nrows()
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        vec![mmd2_from_gram(
            self.gram.view(),
            x,
            y,
            self.estimator,
            Some(self.total),
        )]
    }
}

/// Pooled rows evaluated by the linear-time estimator
///
/// Only the `2·pairs` kernel terms of each split are computed, so no Gram
/// matrix is built.
#[derive(Debug, Clone)]
pub struct PairSplit<'a> {
    rows: Cow<'a, Array2<f64>>,
    kernel: &'a GaussianRbf,
}

impl<'a> PairSplit<'a> {
    pub fn new(rows: Cow<'a, Array2<f64>>, kernel: &'a GaussianRbf) -> Self {
        Self { rows, kernel }
    }

    pub fn terms(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        paired_terms(x, y, |i, j| self.kernel.evaluate(self.rows.row(i), self.rows.row(j)))
    }
}

impl SplitStatistic for PairSplit<'_> {
    fn n_rows(&self) -> usize {
        self.rows.nrows()
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        vec![mean_or_zero(&self.terms(x, y))]
    }
}

/// Split evaluator chosen by the MMD estimator
#[derive(Debug, Clone)]
pub enum MmdSplit<'a> {
    Gram(GramSplit<'a>),
    Pairs(PairSplit<'a>),
}

impl SplitStatistic for MmdSplit<'_> {
    fn n_rows(&self) -> usize {
        match self {
            MmdSplit::Gram(g) => g.n_rows(),
            MmdSplit::Pairs(p) => p.n_rows(),
        }
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        match self {
            MmdSplit::Gram(g) => g.evaluate(x, y),
            MmdSplit::Pairs(p) => p.evaluate(x, y),
        }
    }
}

/// MMD statistic fitted to a reference sample
#[derive(Debug, Clone)]
pub struct MmdStatistic {
    reference: Sample,
    kernel: GaussianRbf,
    estimator: MmdEstimator,
    reference_gram: OnceLock<Arc<Array2<f64>>>,
}

impl MmdStatistic {
    /// Resolve the bandwidth against the reference and fit
    pub fn fit(
        reference: &Sample,
        estimator: MmdEstimator,
        bandwidth: &Bandwidth,
    ) -> Result<(Self, Option<Degeneracy>)> {
        let (kernel, warning) = bandwidth.resolve(reference.view())?;
        Ok((Self::with_kernel(reference, kernel, estimator), warning))
    }

    pub fn with_kernel(reference: &Sample, kernel: GaussianRbf, estimator: MmdEstimator) -> Self {
        Self {
            reference: reference.clone(),
            kernel,
            estimator,
            reference_gram: OnceLock::new(),
        }
    }

    pub fn kernel(&self) -> &GaussianRbf {
        &self.kernel
    }

    pub fn estimator(&self) -> MmdEstimator {
        self.estimator
    }

    pub fn min_samples(&self) -> usize {
        self.estimator.min_samples()
    }

    /// Kernel matrix of the reference, computed on first use
    pub fn reference_gram(&self) -> &Arc<Array2<f64>> {
        self.reference_gram.get_or_init(|| {
            let r = self.reference.view();
            Arc::new(self.kernel.matrix(r, r))
        })
    }

    /// Gram matrix of the reference stacked on top of `test`
    pub fn pooled_gram(&self, test: &Sample) -> Array2<f64> {
        let n = self.reference.n_samples();
        let m = test.n_samples();
        let k_rr = self.reference_gram();
        let k_rt = self.kernel.matrix(self.reference.view(), test.view());
        let k_tt = self.kernel.matrix(test.view(), test.view());

        let mut gram = Array2::zeros((n + m, n + m));
        gram.slice_mut(s![..n, ..n]).assign(k_rr.as_ref());
        gram.slice_mut(s![..n, n..]).assign(&k_rt);
        gram.slice_mut(s![n.., ..n]).assign(&k_rt.t());
        gram.slice_mut(s![n.., n..]).assign(&k_tt);
        gram
    }

    /// Split evaluator over the pooled reference and test rows
    pub fn pooled(&self, test: &Sample) -> Result<MmdSplit<'_>> {
        if self.estimator == MmdEstimator::Linear {
            let rows = self.reference.concat(test)?;
            return Ok(MmdSplit::Pairs(PairSplit::new(
                Cow::Owned(rows.as_array().clone()),
                &self.kernel,
            )));
        }
        Ok(MmdSplit::Gram(GramSplit::new(
            Cow::Owned(self.pooled_gram(test)),
            self.estimator,
        )))
    }

    /// Split evaluator over the reference rows only
    pub fn reference_split(&self) -> MmdSplit<'_> {
        if self.estimator == MmdEstimator::Linear {
            return MmdSplit::Pairs(PairSplit::new(
                Cow::Borrowed(self.reference.as_array()),
                &self.kernel,
            ));
        }
        MmdSplit::Gram(GramSplit::new(
            Cow::Borrowed(self.reference_gram().as_ref()),
            self.estimator,
        ))
    }

    /// Observed MMD² between the reference and `test`
    pub fn compute(&self, test: &Sample) -> f64 {
        let n = self.reference.n_samples();
        let m = test.n_samples();
        let x: Vec<usize> = (0..n).collect();
        let y: Vec<usize> = (n..n + m).collect();
        if self.estimator == MmdEstimator::Linear {
            return self.linear_terms(test).iter().sum::<f64>()
                / (n.min(m) / 2).max(1) as f64;
        }
        let gram = self.pooled_gram(test);
        mmd2_from_gram(gram.view(), &x, &y, self.estimator, None)
    }

    /// Linear-time terms evaluated directly, without materialising a Gram matrix
    pub fn linear_terms(&self, test: &Sample) -> Vec<f64> {
        let pairs = self.reference.n_samples().min(test.n_samples()) / 2;
        let k = |a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>| self.kernel.evaluate(a, b);
        (0..pairs)
            .map(|i| {
                let (x1, x2) = (self.reference.row(2 * i), self.reference.row(2 * i + 1));
                let (y1, y2) = (test.row(2 * i), test.row(2 * i + 1));
                k(x1, x2) + k(y1, y2) - k(x1, y2) - k(x2, y1)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::seq::SliceRandom;
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
    fn test_identical_samples_biased_is_zero() {
        let x = normal_sample(20, 2, 0.0, 1);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Biased, &Bandwidth::MedianHeuristic).unwrap();
        assert!(stat.compute(&x).abs() < 1e-10);
    }

    #[test]
    fn test_shift_increases_mmd() {
        let x = normal_sample(60, 2, 0.0, 1);
        let y_same = normal_sample(60, 2, 0.0, 2);
        let y_shift = normal_sample(60, 2, 2.0, 3);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Unbiased, &Bandwidth::MedianHeuristic).unwrap();
        assert!(stat.compute(&y_shift) > stat.compute(&y_same) + 0.1);
    }

    #[test]
    fn test_partition_shortcut_matches_direct_sum() {
        let x = normal_sample(15, 3, 0.0, 4);
        let y = normal_sample(10, 3, 0.5, 5);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Unbiased, &Bandwidth::Fixed(vec![1.0])).unwrap();
        let split = GramSplit::new(Cow::Owned(stat.pooled_gram(&y)), MmdEstimator::Unbiased);
        let xi: Vec<usize> = (0..15).collect();
        let yi: Vec<usize> = (15..25).collect();
        let fast = split.evaluate(&xi, &yi)[0];
        let direct = mmd2_from_gram(split.gram(), &xi, &yi, MmdEstimator::Unbiased, None);
        assert!((fast - direct).abs() < 1e-10);
        assert!((fast - stat.compute(&y)).abs() < 1e-10);
    }

    #[test]
    fn test_linear_terms_match_gram() {
        let x = normal_sample(12, 2, 0.0, 6);
        let y = normal_sample(12, 2, 1.0, 7);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Linear, &Bandwidth::Fixed(vec![1.5])).unwrap();
        let direct = stat.linear_terms(&y);
        let gram = stat.pooled_gram(&y);
        let xi: Vec<usize> = (0..12).collect();
        let yi: Vec<usize> = (12..24).collect();
        let from_gram = linear_terms(gram.view(), &xi, &yi);
        assert_eq!(direct.len(), 6);
        for (a, b) in direct.iter().zip(from_gram.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_linear_split_avoids_gram() {
        let x = normal_sample(30, 2, 0.0, 10);
        let y = normal_sample(20, 2, 0.5, 11);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Linear, &Bandwidth::Fixed(vec![1.0])).unwrap();
        let split = stat.pooled(&y).unwrap();
        assert!(matches!(split, MmdSplit::Pairs(_)));
        assert_eq!(split.n_rows(), 50);

        let gram = stat.pooled_gram(&y);
        let mut rows: Vec<usize> = (0..50).collect();
        rows.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(12));
        let (a, b) = rows.split_at(30);
        let from_gram = mmd2_from_gram(gram.view(), a, b, MmdEstimator::Linear, None);
        assert!((split.evaluate(a, b)[0] - from_gram).abs() < 1e-10);

        let xi: Vec<usize> = (0..30).collect();
        let yi: Vec<usize> = (30..50).collect();
        assert!((split.evaluate(&xi, &yi)[0] - stat.compute(&y)).abs() < 1e-12);
        assert!(matches!(stat.reference_split(), MmdSplit::Pairs(_)));
    }

    #[test]
    fn test_linear_asymptotic_detects_shift() {
        let x = normal_sample(400, 1, 0.0, 8);
        let y = normal_sample(400, 1, 1.5, 9);
        let (stat, _) = MmdStatistic::fit(&x, MmdEstimator::Linear, &Bandwidth::MedianHeuristic).unwrap();
        let (p, std, warning) = linear_asymptotic(&stat.linear_terms(&y));
        assert!(p < 0.01);
        assert!(std > 0.0);
        assert!(warning.is_none());
    }

    #[test]
    fn test_zero_variance_terms() {
        let (p, _, warning) = linear_asymptotic(&[0.0, 0.0, 0.0]);
        assert_eq!(p, 1.0);
        assert_eq!(warning.unwrap().kind, DegeneracyKind::ZeroNullVariance);
    }
}
