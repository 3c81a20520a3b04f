//! Online least-squares density difference

use super::thresholds::conditional_thresholds;
use super::window::RingWindow;
use crate::error::{Degeneracy, DegeneracyKind, DriftError, Result};
use crate::kernel::Bandwidth;
use crate::sample::Sample;
use crate::statistic::{center_gram, draw_centers, mean_rows, select_lambda, LsddModel, Standardizer};
use crate::utils::{split_indices, stream_rng};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

/// Redraws of the initial window before giving up
const MAX_INIT_ATTEMPTS: usize = 100;

/// Seed stream for the kernel centres
const CENTER_STREAM: u64 = u64::MAX;

struct Bootstrap {
    reference_mean: Array1<f64>,
    /// Centre-kernel rows of the `2W - 1` stream points
    stream: Array2<f64>,
}

impl Bootstrap {
    fn h(&self, t: usize, w: usize) -> Array1<f64> {
        let rows: Vec<usize> = (t..t + w).collect();
        &self.reference_mean - &mean_rows(self.stream.view(), &rows)
    }
}

/// Sliding-window LSDD; the window holds centre-kernel rows, not raw points
#[derive(Debug, Clone)]
pub(crate) struct LsddOnline {
    model: LsddModel,
    /// Reference rows not used as kernel centres
    reference: Sample,
    reference_features: Array2<f64>,
    window_size: usize,
    thresholds: Vec<f64>,
    reference_mean: Array1<f64>,
    window: RingWindow,
    window_sum: Array1<f64>,
}

impl LsddOnline {
    /// Length of a bootstrap stream: `W` initial window points plus `W - 1` arrivals
    fn stream_len(window_size: usize) -> usize {
        2 * window_size - 1
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fit(
        reference: &Sample,
        bandwidth: &Bandwidth,
        n_kernel_centers: Option<usize>,
        window_size: usize,
        n_bootstraps: usize,
        fpr: f64,
        lambda_rd_max: f64,
        seed: u64,
    ) -> Result<(Self, Vec<Degeneracy>)> {
        let n = reference.n_samples();
        let n_centers = n_kernel_centers.unwrap_or(2 * window_size);
        let etw = Self::stream_len(window_size);
        let required = n_centers + etw + 2;
        if n < required {
            return Err(DriftError::insufficient("online lsdd", required, n));
        }

        let (standardizer, mut warnings) = Standardizer::fit(reference);
        let z = standardizer.transform(reference.view());
        let (kernel, bw_warning) = bandwidth.resolve(z.view())?;
        warnings.extend(bw_warning);

        let mut rng = stream_rng(seed, CENTER_STREAM);
        let (centers, rest, center_warning) = draw_centers(z.view(), n_centers, &mut rng);
        warnings.extend(center_warning);
        let effective = reference.select(&rest);
        let features = kernel.matrix(z.select(Axis(0), &rest).view(), centers.view());
        let h_matrix = center_gram(&kernel, centers.view());

        let n_eff = rest.len();
        let n_ref = n_eff - etw;
        let bootstraps: Vec<Bootstrap> = (0..n_bootstraps)
            .into_par_iter()
            .map(|b| {
                let mut rng = stream_rng(seed, b as u64);
                let (p, q) = split_indices(n_eff, n_ref, &mut rng);
                Bootstrap {
                    reference_mean: mean_rows(features.view(), &p),
                    stream: features.select(Axis(0), &q),
                }
            })
            .collect();

        let h_samples: Vec<Array1<f64>> = bootstraps.iter().map(|b| b.h(0, window_size)).collect();
        let (lambda, h_lam_inv, lambda_warnings) = select_lambda(&h_samples, &h_matrix, lambda_rd_max)?;
        warnings.extend(lambda_warnings);
        let model = LsddModel::new(standardizer, kernel, centers, lambda, h_lam_inv);

        let (thresholds, threshold_warnings) = conditional_thresholds(n_bootstraps, window_size, fpr, |b, t| {
            let h = bootstraps[b].h(t, window_size);
            model.statistic(h.view())
        });
        warnings.extend(threshold_warnings);

        Ok((Self::from_parts(model, &effective, window_size, thresholds), warnings))
    }

    /// Rebuild from a fitted model and the non-centre reference rows
    pub fn from_parts(model: LsddModel, reference: &Sample, window_size: usize, thresholds: Vec<f64>) -> Self {
        let reference_features = model.center_kernel(reference.view());
        let nc = model.n_centers();
        Self {
            reference: reference.clone(),
            reference_features,
            window_size,
            thresholds,
            reference_mean: Array1::zeros(nc),
            window: RingWindow::new(window_size, nc),
            window_sum: Array1::zeros(nc),
            model,
        }
    }

    pub fn model(&self) -> &LsddModel {
        &self.model
    }

    /// Reference rows left after the kernel centres were drawn
    pub fn reference(&self) -> &Sample {
        &self.reference
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Threshold after `t` ingested points; the pre-filled window makes `t = 0` valid
    pub fn threshold_at(&self, t: u64) -> f64 {
        let idx = t.min(self.window_size as u64 - 1) as usize;
        self.thresholds[idx]
    }

    fn current(&self) -> f64 {
        let h = &self.reference_mean - &(&self.window_sum / self.window_size as f64);
        self.model.statistic(h.view())
    }

    /// Draw a reference subset and pre-fill the window with held-out reference rows
    ///
    /// Draws are repeated until the initial statistic falls below the first
    /// threshold, so a fresh detector does not start in an alarmed state.
    pub fn start(&mut self, rng: &mut Xoshiro256PlusPlus) -> Option<Degeneracy> {
        let n_eff = self.reference_features.nrows();
        let n_ref = n_eff - Self::stream_len(self.window_size);
        for _ in 0..MAX_INIT_ATTEMPTS {
            self.fill(n_eff, n_ref, rng);
            if self.current() < self.thresholds[0] {
                return None;
            }
        }
        Some(Degeneracy::new(
            DegeneracyKind::WindowInitialisation,
            format!(
                "initial window exceeded the first threshold in {} draws",
                MAX_INIT_ATTEMPTS
            ),
        ))
    }

    fn fill(&mut self, n_eff: usize, n_ref: usize, rng: &mut Xoshiro256PlusPlus) {
        let (p, q) = split_indices(n_eff, n_ref, rng);
        self.reference_mean = mean_rows(self.reference_features.view(), &p);
        self.window.clear();
        self.window_sum.fill(0.0);
        for &i in q.iter().take(self.window_size) {
            let row = self.reference_features.row(i);
            self.window.push(row);
            self.window_sum += &row;
        }
    }

    /// Slide the window by one point and return the statistic
    pub fn ingest(&mut self, point: ArrayView1<f64>) -> f64 {
        let row = self.model.center_kernel_point(point);
        if let Some(oldest) = self.window.oldest() {
            if self.window.is_full() {
                self.window_sum -= &oldest;
            }
        }
        self.window.push(row.view());
        self.window_sum += &row;
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::seeded_rng;
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

    fn fitted(seed: u64) -> LsddOnline {
        let reference = normal_sample(200, 2, 0.0, 1);
        LsddOnline::fit(&reference, &Bandwidth::MedianHeuristic, None, 5, 200, 0.02, 0.2, seed)
            .unwrap()
            .0
    }

    #[test]
    fn test_centres_leave_reference() {
        let online = fitted(0);
        assert_eq!(online.model().n_centers(), 10);
        assert_eq!(online.reference().n_samples(), 190);
        assert_eq!(online.thresholds().len(), 5);
    }

    #[test]
    fn test_start_prefills_below_first_threshold() {
        let mut online = fitted(0);
        let warning = online.start(&mut seeded_rng(4));
        assert!(warning.is_none());
        assert!(online.window.is_full());
        assert!(online.current() < online.thresholds()[0]);
    }

    #[test]
    fn test_incremental_matches_direct() {
        let mut online = fitted(1);
        online.start(&mut seeded_rng(2));
        let stream = normal_sample(12, 2, 0.0, 3);
        let mut last = 0.0;
        for i in 0..12 {
            last = online.ingest(stream.row(i));
        }
        let window: Vec<Array1<f64>> = (7..12).map(|i| online.model.center_kernel_point(stream.row(i))).collect();
        let mean = window.iter().fold(Array1::<f64>::zeros(10), |acc, r| acc + r) / 5.0;
        let h = &online.reference_mean - &mean;
        assert!((last - online.model.statistic(h.view())).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_schedule_starts_with_prefilled_window() {
        let online = fitted(0);
        let model = online.model().clone();
        let online = LsddOnline::from_parts(model, online.reference(), 3, vec![0.0, 1.0, 2.0]);
        assert_eq!(online.threshold_at(0), 0.0);
        assert_eq!(online.threshold_at(1), 1.0);
        assert_eq!(online.threshold_at(2), 2.0);
        assert_eq!(online.threshold_at(50), 2.0);
    }

    #[test]
    fn test_reference_too_small() {
        let reference = normal_sample(15, 1, 0.0, 1);
        let err = LsddOnline::fit(&reference, &Bandwidth::MedianHeuristic, None, 5, 10, 0.05, 0.2, 0)
            .err()
            .unwrap();
        assert!(matches!(err, DriftError::InsufficientSamples { .. }));
    }
}
