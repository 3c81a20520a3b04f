//! Gaussian RBF kernel and bandwidth selection

use crate::error::{Degeneracy, DegeneracyKind, DriftError, Result};
use crate::utils::{quantile, sort_f64};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Rows used by the median heuristic; larger references are strided down
const MEDIAN_MAX_ROWS: usize = 1000;

/// Pairwise squared Euclidean distances between the rows of `x` and `y`
pub fn squared_distances(x: ArrayView2<f64>, y: ArrayView2<f64>) -> Array2<f64> {
    let x_norms: Array1<f64> = x.rows().into_iter().map(|r| r.dot(&r)).collect();
    let y_norms: Array1<f64> = y.rows().into_iter().map(|r| r.dot(&r)).collect();
    let mut dist = x.dot(&y.t());
    for ((i, j), v) in dist.indexed_iter_mut() {
        *v = (x_norms[i] + y_norms[j] - 2.0 * *v).max(0.0);
    }
    dist
}

/// Median heuristic bandwidth: sqrt(median pairwise squared distance / 2)
///
/// Returns 0.0 when fewer than two rows are available or every pair
/// coincides.
pub fn median_heuristic(x: ArrayView2<f64>) -> f64 {
    let n = x.nrows();
    if n < 2 {
        return 0.0;
    }
    let step = (n + MEDIAN_MAX_ROWS - 1) / MEDIAN_MAX_ROWS;
    let rows: Vec<usize> = (0..n).step_by(step.max(1)).collect();
    let x = x.select(Axis(0), &rows);
    let dist = squared_distances(x.view(), x.view());

    let m = rows.len();
    let mut upper = Vec::with_capacity(m * (m - 1) / 2);
    for i in 0..m {
        for j in (i + 1)..m {
            upper.push(dist[[i, j]]);
        }
    }
    sort_f64(&mut upper);
    (0.5 * quantile(&upper, 0.5)).sqrt()
}

/// Gaussian RBF kernel `k(x, y) = exp(-||x - y||² / (2σ²))`
///
/// With several bandwidths the kernel value is the mean over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianRbf {
    sigmas: Vec<f64>,
}

impl GaussianRbf {
    pub fn new(sigmas: Vec<f64>) -> Result<Self> {
        if sigmas.is_empty() {
            return Err(DriftError::InvalidConfiguration(
                "at least one kernel bandwidth is required".to_string(),
            ));
        }
        if let Some(bad) = sigmas.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(DriftError::InvalidConfiguration(format!(
                "kernel bandwidth must be positive and finite, got {}",
                bad
            )));
        }
        Ok(Self { sigmas })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub(crate) fn from_log_sigmas(log_sigmas: &[f64]) -> Self {
        Self {
            sigmas: log_sigmas.iter().map(|l| l.exp()).collect(),
        }
    }

    /// Same kernel with every bandwidth multiplied by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            sigmas: self.sigmas.iter().map(|s| s * factor).collect(),
        }
    }

    /// Kernel value for a squared distance
    #[inline]
    pub fn value(&self, sq_dist: f64) -> f64 {
        let total: f64 = self
            .sigmas
            .iter()
            .map(|s| (-sq_dist / (2.0 * s * s)).exp())
            .sum();
        total / self.sigmas.len() as f64
    }

    /// Kernel value for two feature vectors
    pub fn evaluate(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let sq: f64 = a.iter().zip(b.iter()).map(|(p, q)| (p - q).powi(2)).sum();
        self.value(sq)
    }

    /// Apply the kernel elementwise to a matrix of squared distances
    pub fn from_squared(&self, sq_dist: &Array2<f64>) -> Array2<f64> {
        sq_dist.mapv(|d| self.value(d))
    }

    /// Kernel matrix between the rows of `x` and `y`
    pub fn matrix(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Array2<f64> {
        self.from_squared(&squared_distances(x, y))
    }
}

/// How the kernel bandwidth is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bandwidth {
    /// Fixed bandwidth(s); several values are averaged
    Fixed(Vec<f64>),
    /// Inferred once from the reference sample
    MedianHeuristic,
}

impl Default for Bandwidth {
    fn default() -> Self {
        Bandwidth::MedianHeuristic
    }
}

impl Bandwidth {
    pub fn validate(&self) -> Result<()> {
        match self {
            Bandwidth::Fixed(sigmas) => GaussianRbf::new(sigmas.clone()).map(|_| ()),
            Bandwidth::MedianHeuristic => Ok(()),
        }
    }

    /// Resolve to a concrete kernel using the reference features
    pub fn resolve(&self, reference: ArrayView2<f64>) -> Result<(GaussianRbf, Option<Degeneracy>)> {
        match self {
            Bandwidth::Fixed(sigmas) => Ok((GaussianRbf::new(sigmas.clone())?, None)),
            Bandwidth::MedianHeuristic => {
                let sigma = median_heuristic(reference);
                if sigma > 0.0 && sigma.is_finite() {
                    tracing::debug!(sigma = sigma, "Inferred kernel bandwidth");
                    Ok((GaussianRbf::new(vec![sigma])?, None))
                } else {
                    let warning = Degeneracy::new(
                        DegeneracyKind::ZeroBandwidth,
                        "median pairwise distance is zero, using bandwidth 1.0",
                    );
                    Ok((GaussianRbf::new(vec![1.0])?, Some(warning)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_squared_distances() {
        let x = array![[0.0, 0.0], [1.0, 1.0]];
        let y = array![[0.0, 1.0]];
        let d = squared_distances(x.view(), y.view());
        assert_eq!(d.dim(), (2, 1));
        assert!((d[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((d[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kernel_matrix_properties() {
        let x = array![[0.0], [0.5], [3.0]];
        let k = GaussianRbf::new(vec![1.0]).unwrap().matrix(x.view(), x.view());
        for i in 0..3 {
            assert!((k[[i, i]] - 1.0).abs() < 1e-12);
            for j in 0..3 {
                assert!((k[[i, j]] - k[[j, i]]).abs() < 1e-12);
            }
        }
        assert!((k[[0, 1]] - (-0.125f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_multiple_bandwidths_averaged() {
        let k = GaussianRbf::new(vec![1.0, 2.0]).unwrap();
        let expected = 0.5 * ((-0.5f64).exp() + (-0.125f64).exp());
        assert!((k.value(1.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_bandwidth() {
        assert!(GaussianRbf::new(vec![]).is_err());
        assert!(GaussianRbf::new(vec![0.0]).is_err());
        assert!(Bandwidth::Fixed(vec![-1.0]).validate().is_err());
    }

    #[test]
    fn test_median_heuristic() {
        // squared distances 1, 4, 1 -> median 1
        let x = array![[0.0], [1.0], [2.0]];
        assert!((median_heuristic(x.view()) - 0.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_constant_reference_falls_back() {
        let x = Array2::from_elem((10, 2), 5.0);
        let (kernel, warning) = Bandwidth::MedianHeuristic.resolve(x.view()).unwrap();
        assert_eq!(kernel.sigmas(), &[1.0]);
        assert_eq!(warning.unwrap().kind, DegeneracyKind::ZeroBandwidth);
    }
}
