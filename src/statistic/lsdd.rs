//! Least-squares density difference
//!
//! The density difference `p - q` is modelled as a linear combination of
//! Gaussian basis functions placed at kernel centres drawn from the reference.
//! With `h = mean_x k(x, C) - mean_y k(y, C)` and `H = k_{√2σ}(C, C)` the
//! regularised least-squares solution gives the statistic
//! `hᵀ · 2(H + λI)⁻¹ · h`.

use super::SplitStatistic;
use crate::error::{Degeneracy, DegeneracyKind, DriftError, Result};
use crate::kernel::{squared_distances, Bandwidth, GaussianRbf};
use crate::sample::Sample;
use crate::utils::{regularized_inverse, split_indices, stream_rng};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::f64::consts::SQRT_2;
use std::sync::Arc;

/// Default upper bound on the relative difference caused by regularisation
pub const DEFAULT_LAMBDA_RD_MAX: f64 = 0.2;

/// Number of regularisation candidates `4^-i`
const LAMBDA_GRID_SIZE: i32 = 10;

/// Reference resplits used to choose the regularisation strength offline
const LAMBDA_RESPLITS: usize = 50;

const DUPLICATE_CENTER_TOL: f64 = 1e-12;
const CENTER_JITTER: f64 = 1e-6;

/// Candidate regularisation strengths, largest first
pub fn lambda_grid() -> Vec<f64> {
    (0..LAMBDA_GRID_SIZE).map(|i| 4f64.powi(-i)).collect()
}

/// Mean of the selected rows
pub(crate) fn mean_rows(m: ArrayView2<f64>, rows: &[usize]) -> Array1<f64> {
    let mut acc = Array1::zeros(m.ncols());
    for &i in rows {
        acc += &m.row(i);
    }
    if !rows.is_empty() {
        acc /= rows.len() as f64;
    }
    acc
}

/// Per-feature standardisation fitted on the reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    pub fn fit(reference: &Sample) -> (Self, Vec<Degeneracy>) {
        let mean = reference.mean();
        let std = reference.std();
        let mut warnings = Vec::new();
        let scale = std
            .iter()
            .enumerate()
            .map(|(j, &s)| {
                if s > 0.0 {
                    s
                } else {
                    warnings.push(Degeneracy::for_feature(
                        DegeneracyKind::ZeroVariance,
                        j,
                        "constant reference feature left unscaled",
                    ));
                    1.0
                }
            })
            .collect();
        (Self { mean, scale }, warnings)
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        (&x - &self.mean) / &self.scale
    }

    pub fn transform_point(&self, x: ArrayView1<f64>) -> Array1<f64> {
        (&x - &self.mean) / &self.scale
    }
}

/// Pick `n_centers` reference rows as kernel centres
///
/// Returns the centres and the indices of the remaining rows. Coinciding
/// centres make `H` singular, so they are jittered.
pub(crate) fn draw_centers<R: Rng>(
    standardized: ArrayView2<f64>,
    n_centers: usize,
    rng: &mut R,
) -> (Array2<f64>, Vec<usize>, Option<Degeneracy>) {
    let mut perm: Vec<usize> = (0..standardized.nrows()).collect();
    perm.shuffle(rng);
    let rest = perm.split_off(n_centers.min(perm.len()));
    let mut centers = standardized.select(Axis(0), &perm);

    let dist = squared_distances(centers.view(), centers.view());
    let n = centers.nrows();
    let duplicated = (0..n).any(|i| ((i + 1)..n).any(|j| dist[[i, j]] < DUPLICATE_CENTER_TOL));
    let warning = if duplicated {
        centers.mapv_inplace(|v| {
            let z: f64 = rng.sample(StandardNormal);
            v + CENTER_JITTER * z
        });
        Some(Degeneracy::new(
            DegeneracyKind::DuplicateCenters,
            "duplicate kernel centres jittered",
        ))
    } else {
        None
    };
    (centers, rest, warning)
}

/// `H = k_{√2σ}(C, C)`
pub(crate) fn center_gram(kernel: &GaussianRbf, centers: ArrayView2<f64>) -> Array2<f64> {
    kernel.scaled(SQRT_2).matrix(centers, centers)
}

/// Choose λ from the grid and return it with `2(H + λI)⁻¹`
///
/// The largest λ whose mean relative difference `1 - ωᵀHω / hᵀω` over
/// `h_samples` stays below `lambda_rd_max` is selected.
pub(crate) fn select_lambda(
    h_samples: &[Array1<f64>],
    h: &Array2<f64>,
    lambda_rd_max: f64,
) -> Result<(f64, Array2<f64>, Vec<Degeneracy>)> {
    let mut best: Option<(f64, f64, Array2<f64>, f64)> = None;

    for lambda in lambda_grid() {
        let (inv, ridge) = match regularized_inverse(h, lambda) {
            Some(found) => found,
            None => continue,
        };
        let rds: Vec<f64> = h_samples
            .iter()
            .filter_map(|hb| {
                let omega = inv.dot(hb);
                let denom = hb.dot(&omega);
                if denom.abs() < f64::EPSILON {
                    None
                } else {
                    Some(1.0 - omega.dot(&h.dot(&omega)) / denom)
                }
            })
            .collect();
        let mean_rd = if rds.is_empty() {
            0.0
        } else {
            rds.iter().sum::<f64>() / rds.len() as f64
        };

        if mean_rd < lambda_rd_max {
            let warnings = singular_warning(lambda, ridge).into_iter().collect();
            tracing::debug!(lambda = lambda, relative_difference = mean_rd, "Selected LSDD regularisation");
            return Ok((lambda, inv * 2.0, warnings));
        }
        if best.as_ref().map_or(true, |(rd, ..)| mean_rd < *rd) {
            best = Some((mean_rd, lambda, inv, ridge));
        }
    }

    match best {
        Some((rd, lambda, inv, ridge)) => {
            let mut warnings = vec![Degeneracy::new(
                DegeneracyKind::Regularization,
                format!(
                    "no regularisation strength met the relative difference bound {}, using {} (rd {:.4})",
                    lambda_rd_max, lambda, rd
                ),
            )];
            warnings.extend(singular_warning(lambda, ridge));
            Ok((lambda, inv * 2.0, warnings))
        }
        None => Err(DriftError::Computation(
            "kernel centre matrix could not be inverted".to_string(),
        )),
    }
}

fn singular_warning(lambda: f64, ridge: f64) -> Option<Degeneracy> {
    if ridge > lambda * (1.0 + 1e-9) {
        Some(Degeneracy::new(
            DegeneracyKind::SingularMatrix,
            format!("added ridge {:e} to invert the centre matrix", ridge),
        ))
    } else {
        None
    }
}

/// Fitted LSDD parameters shared by the offline and online detectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsddModel {
    standardizer: Standardizer,
    kernel: GaussianRbf,
    centers: Array2<f64>,
    lambda: f64,
    h_lam_inv: Array2<f64>,
}

impl LsddModel {
    pub(crate) fn new(
        standardizer: Standardizer,
        kernel: GaussianRbf,
        centers: Array2<f64>,
        lambda: f64,
        h_lam_inv: Array2<f64>,
    ) -> Self {
        Self {
            standardizer,
            kernel,
            centers,
            lambda,
            h_lam_inv,
        }
    }

    pub fn kernel(&self) -> &GaussianRbf {
        &self.kernel
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn n_centers(&self) -> usize {
        self.centers.nrows()
    }

    pub fn standardizer(&self) -> &Standardizer {
        &self.standardizer
    }

    /// `k(x, C)` for raw (unstandardised) rows
    pub fn center_kernel(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let z = self.standardizer.transform(x);
        self.kernel.matrix(z.view(), self.centers.view())
    }

    /// `k(x, C)` for a single raw row
    pub fn center_kernel_point(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let z = self.standardizer.transform_point(x);
        self.centers
            .rows()
            .into_iter()
            .map(|c| self.kernel.evaluate(z.view(), c))
            .collect()
    }

    /// `hᵀ · 2(H + λI)⁻¹ · h`
    pub fn statistic(&self, h: ArrayView1<f64>) -> f64 {
        h.dot(&self.h_lam_inv.dot(&h))
    }
}

/// Centre-kernel features of a pooled sample evaluated on index splits
#[derive(Debug, Clone)]
pub struct CenterSplit<'a> {
    features: Cow<'a, Array2<f64>>,
    model: &'a LsddModel,
}

impl SplitStatistic for CenterSplit<'_> {
    fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    fn evaluate(&self, x: &[usize], y: &[usize]) -> Vec<f64> {
        let h = mean_rows(self.features.view(), x) - mean_rows(self.features.view(), y);
        vec![self.model.statistic(h.view())]
    }
}

/// Offline LSDD statistic fitted to a reference sample
///
/// Rows drawn as kernel centres are withheld from the reference used for
/// testing, so the observed split and its permutations stay exchangeable.
#[derive(Debug, Clone)]
pub struct LsddStatistic {
    model: LsddModel,
    reference: Sample,
    reference_features: Arc<Array2<f64>>,
}

impl LsddStatistic {
    /// Default number of kernel centres for a reference of `n` rows
    pub fn default_centers(n: usize) -> usize {
        (n / 20).max(n.min(10)).min(n / 2)
    }

    pub fn fit(
        reference: &Sample,
        bandwidth: &Bandwidth,
        n_kernel_centers: Option<usize>,
        lambda_rd_max: f64,
        seed: u64,
    ) -> Result<(Self, Vec<Degeneracy>)> {
        let n = reference.n_samples();
        if n < 4 {
            return Err(DriftError::insufficient("lsdd", 4, n));
        }
        let (standardizer, mut warnings) = Standardizer::fit(reference);
        let z = standardizer.transform(reference.view());
        let (kernel, bw_warning) = bandwidth.resolve(z.view())?;
        warnings.extend(bw_warning);

        // At least two rows stay behind as the effective reference
        let n_centers = n_kernel_centers
            .unwrap_or_else(|| Self::default_centers(n))
            .clamp(1, n - 2);
        let mut rng = stream_rng(seed, u64::MAX);
        let (centers, rest, center_warning) = draw_centers(z.view(), n_centers, &mut rng);
        warnings.extend(center_warning);

        let h = center_gram(&kernel, centers.view());
        let features = kernel.matrix(z.select(Axis(0), &rest).view(), centers.view());
        let n_eff = rest.len();
        tracing::debug!(centers = n_centers, reference = n_eff, "Drew LSDD kernel centres");

        let h_samples: Vec<Array1<f64>> = (0..LAMBDA_RESPLITS)
            .into_par_iter()
            .map(|b| {
                let mut rng = stream_rng(seed, b as u64);
                let (x, y) = split_indices(n_eff, n_eff / 2, &mut rng);
                mean_rows(features.view(), &x) - mean_rows(features.view(), &y)
            })
            .collect();
        let (lambda, h_lam_inv, lambda_warnings) = select_lambda(&h_samples, &h, lambda_rd_max)?;
        warnings.extend(lambda_warnings);

        let model = LsddModel::new(standardizer, kernel, centers, lambda, h_lam_inv);
        Ok((
            Self {
                model,
                reference: reference.select(&rest),
                reference_features: Arc::new(features),
            },
            warnings,
        ))
    }

    /// Rebuild from previously fitted parameters and the effective reference
    pub fn from_model(model: LsddModel, reference: &Sample) -> Self {
        let features = model.center_kernel(reference.view());
        Self {
            model,
            reference: reference.clone(),
            reference_features: Arc::new(features),
        }
    }

    pub fn model(&self) -> &LsddModel {
        &self.model
    }

    /// Reference rows not used as kernel centres
    pub fn reference(&self) -> &Sample {
        &self.reference
    }

    pub fn n_reference(&self) -> usize {
        self.reference_features.nrows()
    }

    pub fn pooled(&self, test: &Sample) -> Result<CenterSplit<'_>> {
        let test_features = self.model.center_kernel(test.view());
        let features = concatenate(
            Axis(0),
            &[self.reference_features.view(), test_features.view()],
        )?;
        Ok(CenterSplit {
            features: Cow::Owned(features),
            model: &self.model,
        })
    }

    pub fn reference_split(&self) -> CenterSplit<'_> {
        CenterSplit {
            features: Cow::Borrowed(self.reference_features.as_ref()),
            model: &self.model,
        }
    }

    /// Observed statistic between the reference and `test`
    pub fn compute(&self, test: &Sample) -> f64 {
        let test_features = self.model.center_kernel(test.view());
        let ref_rows: Vec<usize> = (0..self.reference_features.nrows()).collect();
        let test_rows: Vec<usize> = (0..test_features.nrows()).collect();
        let h = mean_rows(self.reference_features.view(), &ref_rows)
            - mean_rows(test_features.view(), &test_rows);
        self.model.statistic(h.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::Distribution;
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
    fn test_lambda_grid_descending() {
        let grid = lambda_grid();
        assert_eq!(grid.len(), 10);
        assert_eq!(grid[0], 1.0);
        assert!(grid.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_standardizer_constant_feature() {
        let s = Sample::from_rows(&[vec![1.0, 5.0], vec![3.0, 5.0]]).unwrap();
        let (st, warnings) = Standardizer::fit(&s);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].feature, Some(1));
        let z = st.transform(s.view());
        assert!((z[[0, 0]] + 1.0).abs() < 1e-12);
        assert_eq!(z[[0, 1]], 0.0);
    }

    #[test]
    fn test_duplicate_centers_jittered() {
        let z = Array2::from_elem((6, 2), 1.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let (centers, rest, warning) = draw_centers(z.view(), 3, &mut rng);
        assert_eq!(centers.nrows(), 3);
        assert_eq!(rest.len(), 3);
        assert_eq!(warning.unwrap().kind, DegeneracyKind::DuplicateCenters);
        assert!(centers[[0, 0]] != centers[[1, 0]]);
    }

    #[test]
    fn test_lsdd_separates_shift() {
        let x = normal_sample(200, 2, 0.0, 1);
        let (stat, _) = LsddStatistic::fit(&x, &Bandwidth::MedianHeuristic, None, DEFAULT_LAMBDA_RD_MAX, 7).unwrap();
        let same = stat.compute(&normal_sample(100, 2, 0.0, 2));
        let shifted = stat.compute(&normal_sample(100, 2, 1.5, 3));
        assert!(shifted > same);
        assert!(same >= 0.0);
    }

    #[test]
    fn test_pooled_split_matches_compute() {
        let x = normal_sample(80, 2, 0.0, 4);
        let y = normal_sample(30, 2, 0.5, 5);
        let (stat, _) = LsddStatistic::fit(&x, &Bandwidth::Fixed(vec![1.0]), Some(10), DEFAULT_LAMBDA_RD_MAX, 1).unwrap();
        let split = stat.pooled(&y).unwrap();
        assert_eq!(stat.n_reference(), 70);
        let xi: Vec<usize> = (0..70).collect();
        let yi: Vec<usize> = (70..100).collect();
        assert!((split.evaluate(&xi, &yi)[0] - stat.compute(&y)).abs() < 1e-10);
    }

    #[test]
    fn test_centers_withheld_from_reference() {
        let x = normal_sample(60, 2, 0.0, 8);
        let (stat, _) = LsddStatistic::fit(&x, &Bandwidth::Fixed(vec![1.0]), Some(15), DEFAULT_LAMBDA_RD_MAX, 2).unwrap();
        assert_eq!(stat.reference().n_samples(), 45);
        assert_eq!(stat.reference_split().n_rows(), 45);

        // No remaining reference row coincides with a centre
        let z = stat.model().standardizer().transform(stat.reference().view());
        let dist = squared_distances(z.view(), stat.model().centers.view());
        assert!(dist.iter().all(|&d| d > 1e-12));

        let restored = LsddStatistic::from_model(stat.model().clone(), stat.reference());
        let y = normal_sample(20, 2, 0.0, 9);
        assert!((restored.compute(&y) - stat.compute(&y)).abs() < 1e-12);
    }

    #[test]
    fn test_small_reference_keeps_rows_for_testing() {
        let x = normal_sample(10, 1, 0.0, 3);
        let (stat, _) = LsddStatistic::fit(&x, &Bandwidth::MedianHeuristic, None, DEFAULT_LAMBDA_RD_MAX, 0).unwrap();
        assert_eq!(stat.model().n_centers(), 5);
        assert_eq!(stat.n_reference(), 5);
    }

    #[test]
    fn test_too_few_reference_rows() {
        let x = normal_sample(3, 1, 0.0, 1);
        let err = LsddStatistic::fit(&x, &Bandwidth::MedianHeuristic, None, 0.2, 0).unwrap_err();
        assert!(matches!(err, DriftError::InsufficientSamples { .. }));
    }
}
