//! Online MMD with incrementally maintained kernel sums

use super::thresholds::conditional_thresholds;
use super::window::RingWindow;
use crate::error::{Degeneracy, DriftError, Result};
use crate::kernel::GaussianRbf;
use crate::sample::Sample;
use crate::utils::{split_indices, stream_rng};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

/// Kernel sums of one bootstrap stream
struct Bootstrap {
    /// Off-diagonal mean of the kernel over the reference part
    reference_mean: f64,
    /// Kernel sum from each stream point to the reference part
    to_reference: Vec<f64>,
    /// Kernel among the `2W` stream points
    stream_gram: Array2<f64>,
}

impl Bootstrap {
    fn statistic(&self, t: usize, w: usize, n_ref: usize) -> f64 {
        let window = t..t + w;
        let mut yy = 0.0;
        for a in window.clone() {
            for c in window.clone() {
                if a != c {
                    yy += self.stream_gram[[a, c]];
                }
            }
        }
        let xy: f64 = self.to_reference[window].iter().sum();
        let wf = w as f64;
        self.reference_mean + yy / (wf * (wf - 1.0)) - 2.0 * xy / (n_ref as f64 * wf)
    }
}

/// Sliding-window MMD² against a random subset of the reference
///
/// Each stream point costs one kernel row against the reference subset and
/// one against the window; the window sums are updated in place.
#[derive(Debug, Clone)]
pub(crate) struct MmdOnline {
    kernel: GaussianRbf,
    reference: Sample,
    window_size: usize,
    thresholds: Vec<f64>,
    subset: Array2<f64>,
    subset_mean: f64,
    window: RingWindow,
    to_subset: Vec<f64>,
    to_subset_sum: f64,
    window_gram: Array2<f64>,
    window_sum: f64,
}

impl MmdOnline {
    /// Rows of the reference left over for the subset
    fn subset_size(n: usize, window_size: usize) -> usize {
        n - 2 * window_size
    }

    pub fn min_reference(window_size: usize) -> usize {
        2 * window_size + 2
    }

    /// Simulate thresholds from bootstrap streams drawn out of the reference
    pub fn fit(
        reference: &Sample,
        kernel: GaussianRbf,
        window_size: usize,
        n_bootstraps: usize,
        fpr: f64,
        seed: u64,
    ) -> Result<(Self, Vec<Degeneracy>)> {
        let n = reference.n_samples();
        if n < Self::min_reference(window_size) {
            return Err(DriftError::insufficient("online mmd", Self::min_reference(window_size), n));
        }
        let n_ref = Self::subset_size(n, window_size);
        let gram = kernel.matrix(reference.view(), reference.view());
        let col_sums = gram.sum_axis(Axis(0));
        let total_offdiag = gram.sum() - gram.diag().sum();

        let bootstraps: Vec<Bootstrap> = (0..n_bootstraps)
            .into_par_iter()
            .map(|b| {
                let mut rng = stream_rng(seed, b as u64);
                let (_, stream) = split_indices(n, n_ref, &mut rng);
                let stream_gram = gram.select(Axis(0), &stream).select(Axis(1), &stream);
                let to_reference: Vec<f64> = stream
                    .iter()
                    .enumerate()
                    .map(|(a, &j)| col_sums[j] - stream_gram.column(a).sum())
                    .collect();
                let stream_offdiag = stream_gram.sum() - stream_gram.diag().sum();
                let cross: f64 = to_reference.iter().sum();
                let rf = n_ref as f64;
                Bootstrap {
                    reference_mean: (total_offdiag - stream_offdiag - 2.0 * cross) / (rf * (rf - 1.0)),
                    to_reference,
                    stream_gram,
                }
            })
            .collect();

        let (thresholds, warnings) = conditional_thresholds(n_bootstraps, window_size, fpr, |b, t| {
            bootstraps[b].statistic(t, window_size, n_ref)
        });
        Ok((Self::from_parts(reference, kernel, window_size, thresholds), warnings))
    }

    /// Rebuild from fitted thresholds; `start` must be called before ingesting
    pub fn from_parts(reference: &Sample, kernel: GaussianRbf, window_size: usize, thresholds: Vec<f64>) -> Self {
        let d = reference.n_features();
        Self {
            kernel,
            reference: reference.clone(),
            window_size,
            thresholds,
            subset: Array2::zeros((0, d)),
            subset_mean: 0.0,
            window: RingWindow::new(window_size, d),
            to_subset: vec![0.0; window_size],
            to_subset_sum: 0.0,
            window_gram: Array2::zeros((window_size, window_size)),
            window_sum: 0.0,
        }
    }

    pub fn kernel(&self) -> &GaussianRbf {
        &self.kernel
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Threshold after `t` ingested points; the statistic exists once `t >= W`
    pub fn threshold_at(&self, t: u64) -> f64 {
        let w = self.window_size as u64;
        let idx = t.saturating_sub(w).min(w - 1) as usize;
        self.thresholds[idx]
    }

    /// Draw a fresh reference subset and empty the window
    pub fn start(&mut self, rng: &mut Xoshiro256PlusPlus) {
        let n = self.reference.n_samples();
        let (subset, _) = split_indices(n, Self::subset_size(n, self.window_size), rng);
        self.subset = self.reference.select(&subset).as_array().clone();
        let gram = self.kernel.matrix(self.subset.view(), self.subset.view());
        let rf = self.subset.nrows() as f64;
        self.subset_mean = (gram.sum() - gram.diag().sum()) / (rf * (rf - 1.0));

        self.window.clear();
        self.to_subset.iter_mut().for_each(|v| *v = 0.0);
        self.to_subset_sum = 0.0;
        self.window_gram.fill(0.0);
        self.window_sum = 0.0;
    }

    /// Add a point; returns MMD² once the window is full
    pub fn ingest(&mut self, point: ArrayView1<f64>) -> Option<f64> {
        let to_subset: f64 = self
            .subset
            .rows()
            .into_iter()
            .map(|r| self.kernel.evaluate(r, point))
            .sum();

        let push = self.window.push(point);
        let slot = push.slot;
        if push.evicted {
            self.to_subset_sum -= self.to_subset[slot];
        }
        self.to_subset[slot] = to_subset;
        self.to_subset_sum += to_subset;

        let others: Vec<usize> = self.window.slots().filter(|&j| j != slot).collect();
        let values: Array1<f64> = others
            .iter()
            .map(|&j| self.kernel.evaluate(point, self.window.row(j)))
            .collect();
        for (&j, &v) in others.iter().zip(values.iter()) {
            if push.evicted {
                self.window_sum -= 2.0 * self.window_gram[[slot, j]];
            }
            self.window_gram[[slot, j]] = v;
            self.window_gram[[j, slot]] = v;
            self.window_sum += 2.0 * v;
        }

        if !self.window.is_full() {
            return None;
        }
        let w = self.window_size as f64;
        let rf = self.subset.nrows() as f64;
        Some(self.subset_mean + self.window_sum / (w * (w - 1.0)) - 2.0 * self.to_subset_sum / (rf * w))
    }
}
