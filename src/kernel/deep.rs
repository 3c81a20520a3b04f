use super::rbf::{squared_distances, GaussianRbf};
use crate::error::{DriftError, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Deep kernel `k(x, y) = (1 - ε)·k_a(φ(x), φ(y)) + ε·k_b(x, y)`
///
/// `φ` is an external projection applied before the kernel is evaluated, so
/// the kernel itself only sees projected and raw feature matrices. Without a
/// raw-space component `ε` is zero and the kernel reduces to `k_a`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepKernel {
    kernel_a: GaussianRbf,
    kernel_b: Option<GaussianRbf>,
    eps: f64,
}

impl DeepKernel {
    pub fn new(kernel_a: GaussianRbf, kernel_b: Option<GaussianRbf>, eps: f64) -> Result<Self> {
        match kernel_b {
            Some(_) if !(eps > 0.0 && eps < 1.0) => Err(DriftError::InvalidConfiguration(format!(
                "deep kernel eps must be in (0, 1), got {}",
                eps
            ))),
            Some(kb) => Ok(Self {
                kernel_a,
                kernel_b: Some(kb),
                eps,
            }),
            None => Ok(Self {
                kernel_a,
                kernel_b: None,
                eps: 0.0,
            }),
        }
    }

    pub fn kernel_a(&self) -> &GaussianRbf {
        &self.kernel_a
    }

    pub fn kernel_b(&self) -> Option<&GaussianRbf> {
        self.kernel_b.as_ref()
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Unconstrained parameters: log bandwidths of `k_a`, then of `k_b`, then logit(ε)
    pub(crate) fn parameters(&self) -> Vec<f64> {
        let mut params: Vec<f64> = self.kernel_a.sigmas().iter().map(|s| s.ln()).collect();
        if let Some(kb) = &self.kernel_b {
            params.extend(kb.sigmas().iter().map(|s| s.ln()));
            params.push((self.eps / (1.0 - self.eps)).ln());
        }
        params
    }

    /// Kernel with the same structure rebuilt from unconstrained parameters
    pub(crate) fn with_parameters(&self, params: &[f64]) -> Self {
        let n_a = self.kernel_a.sigmas().len();
        let kernel_a = GaussianRbf::from_log_sigmas(&params[..n_a]);
        match &self.kernel_b {
            Some(kb) => {
                let n_b = kb.sigmas().len();
                let logit = params[n_a + n_b];
                Self {
                    kernel_a,
                    kernel_b: Some(GaussianRbf::from_log_sigmas(&params[n_a..n_a + n_b])),
                    eps: 1.0 / (1.0 + (-logit).exp()),
                }
            }
            None => Self {
                kernel_a,
                kernel_b: None,
                eps: 0.0,
            },
        }
    }

    /// Kernel matrix from precomputed squared distances
    pub fn from_squared(&self, projected_sq: &Array2<f64>, raw_sq: Option<&Array2<f64>>) -> Array2<f64> {
        let k_a = self.kernel_a.from_squared(projected_sq);
        match (&self.kernel_b, raw_sq) {
            (Some(kb), Some(raw_sq)) => k_a * (1.0 - self.eps) + kb.from_squared(raw_sq) * self.eps,
            _ => k_a,
        }
    }

    /// Kernel matrix between two batches given their projections and raw features
    pub fn matrix(
        &self,
        projected_x: ArrayView2<f64>,
        projected_y: ArrayView2<f64>,
        raw_x: ArrayView2<f64>,
        raw_y: ArrayView2<f64>,
    ) -> Array2<f64> {
        let projected_sq = squared_distances(projected_x, projected_y);
        match self.kernel_b {
            Some(_) => {
                let raw_sq = squared_distances(raw_x, raw_y);
                self.from_squared(&projected_sq, Some(&raw_sq))
            }
            None => self.from_squared(&projected_sq, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn rbf(s: f64) -> GaussianRbf {
        GaussianRbf::new(vec![s]).unwrap()
    }

    #[test]
    fn test_mixture_of_kernels() {
        let kernel = DeepKernel::new(rbf(1.0), Some(rbf(2.0)), 0.25).unwrap();
        let proj = array![[0.0], [1.0]];
        let raw = array![[0.0, 0.0], [2.0, 0.0]];
        let k = kernel.matrix(proj.view(), proj.view(), raw.view(), raw.view());
        let expected = 0.75 * (-0.5f64).exp() + 0.25 * (-0.5f64).exp();
        assert!((k[[0, 1]] - expected).abs() < 1e-12);
        assert!((k[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parameters_round_trip() {
        let kernel = DeepKernel::new(rbf(0.7), Some(rbf(3.0)), 0.1).unwrap();
        let rebuilt = kernel.with_parameters(&kernel.parameters());
        assert!((rebuilt.eps() - 0.1).abs() < 1e-12);
        assert!((rebuilt.kernel_a().sigmas()[0] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_eps_out_of_range() {
        assert!(DeepKernel::new(rbf(1.0), Some(rbf(1.0)), 1.0).is_err());
        let k = DeepKernel::new(rbf(1.0), None, 5.0).unwrap();
        assert_eq!(k.eps(), 0.0);
    }
}
