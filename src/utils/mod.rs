//! Utility functions and types

pub mod linalg;
pub mod random;

pub use linalg::{matrix_inverse, regularized_inverse};
pub use random::{counter_seed, quantile, seeded_rng, sort_f64, split_indices, stream_rng, Timer};
