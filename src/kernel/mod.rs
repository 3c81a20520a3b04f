//! Kernels over feature vectors
//!
//! Gaussian RBF kernels (optionally averaged over several bandwidths), the
//! median heuristic used to infer a bandwidth from reference data, and the
//! deep kernel trained by the learned-kernel statistic.

mod deep;
mod rbf;

pub use deep::DeepKernel;
pub use rbf::{median_heuristic, squared_distances, Bandwidth, GaussianRbf};
