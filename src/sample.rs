//! Immutable batches of feature vectors
//!
//! A [`Sample`] is an ordered collection of N feature vectors of fixed
//! dimensionality D, stored row-major in an `Array2<f64>`. The backing array
//! is reference counted so detectors can hand the reference sample to
//! worker threads without copying it.

use crate::error::{DriftError, Result};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An ordered, immutable batch of feature vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    data: Arc<Array2<f64>>,
}

impl Sample {
    /// Wrap a 2-D array (rows are instances, columns are features)
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.ncols() == 0 {
            return Err(DriftError::shape("at least 1 feature", "0 features"));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(DriftError::InvalidInput(format!(
                "non-finite value at row {}, column {}",
                pos / data.ncols(),
                pos % data.ncols()
            )));
        }
        Ok(Self { data: Arc::new(data) })
    }

    /// Build a sample from row vectors, rejecting ragged input
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n_features = match rows.first() {
            None => return Self::new(Array2::zeros((0, 1))),
            Some(first) => first.len(),
        };
        let mut flat = Vec::with_capacity(rows.len() * n_features);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_features {
                return Err(DriftError::shape(
                    format!("{} features", n_features),
                    format!("{} features in row {}", row.len(), i),
                ));
            }
            flat.extend_from_slice(row);
        }
        let data = Array2::from_shape_vec((rows.len(), n_features), flat)?;
        Self::new(data)
    }

    /// Build a univariate (D = 1) sample
    pub fn from_column(values: &[f64]) -> Result<Self> {
        let data = Array2::from_shape_vec((values.len(), 1), values.to_vec())?;
        Self::new(data)
    }

    /// Build a single-instance sample from one feature vector
    pub fn from_point(point: ArrayView1<f64>) -> Result<Self> {
        let data = point.to_owned().insert_axis(Axis(0));
        Self::new(data)
    }

    /// Number of instances
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    /// Dimensionality of each instance
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Read-only view of the underlying matrix
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.data.row(i)
    }

    pub fn column(&self, j: usize) -> ArrayView1<'_, f64> {
        self.data.column(j)
    }

    /// Rows at the given indices, in order
    pub fn select(&self, indices: &[usize]) -> Sample {
        Sample {
            data: Arc::new(self.data.select(Axis(0), indices)),
        }
    }

    /// Stack `self` on top of `other`
    pub fn concat(&self, other: &Sample) -> Result<Sample> {
        self.check_features(other.n_features())?;
        let data = concatenate(Axis(0), &[self.data.view(), other.data.view()])?;
        Ok(Sample { data: Arc::new(data) })
    }

    /// Keep only the last `n` rows
    pub fn tail(&self, n: usize) -> Sample {
        let start = self.n_samples().saturating_sub(n);
        Sample {
            data: Arc::new(self.data.slice(ndarray::s![start.., ..]).to_owned()),
        }
    }

    /// Uniform random subset of `n` rows without replacement (order preserved)
    pub fn subsample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Sample {
        if n >= self.n_samples() {
            return self.clone();
        }
        let mut picked = index::sample(rng, self.n_samples(), n).into_vec();
        picked.sort_unstable();
        self.select(&picked)
    }

    /// Fail with `InvalidInputShape` unless the dimensionality matches
    pub fn check_features(&self, expected: usize) -> Result<()> {
        if self.n_features() != expected {
            return Err(DriftError::shape(
                format!("{} features", expected),
                format!("{} features", self.n_features()),
            ));
        }
        Ok(())
    }

    /// Column means
    pub fn mean(&self) -> Array1<f64> {
        self.data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.n_features()))
    }

    /// Column standard deviations (population)
    pub fn std(&self) -> Array1<f64> {
        if self.is_empty() {
            return Array1::zeros(self.n_features());
        }
        self.data.std_axis(Axis(0), 0.0)
    }
}

impl TryFrom<Array2<f64>> for Sample {
    type Error = DriftError;

    fn try_from(data: Array2<f64>) -> Result<Self> {
        Sample::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_from_rows() {
        let s = Sample::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(s.n_samples(), 3);
        assert_eq!(s.n_features(), 2);
        assert_eq!(s.row(1)[1], 4.0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = Sample::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, DriftError::InvalidInputShape { .. }));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = Sample::new(array![[1.0, f64::NAN]]).unwrap_err();
        assert!(matches!(err, DriftError::InvalidInput(_)));
    }

    #[test]
    fn test_concat_and_select() {
        let a = Sample::from_column(&[1.0, 2.0]).unwrap();
        let b = Sample::from_column(&[3.0]).unwrap();
        let c = a.concat(&b).unwrap();
        assert_eq!(c.n_samples(), 3);
        let picked = c.select(&[2, 0]);
        assert_eq!(picked.column(0).to_vec(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_concat_dimension_mismatch() {
        let a = Sample::from_column(&[1.0]).unwrap();
        let b = Sample::from_rows(&[vec![1.0, 2.0]]).unwrap();
        assert!(a.concat(&b).is_err());
    }

    #[test]
    fn test_subsample_is_seeded() {
        let s = Sample::from_column(&(0..100).map(f64::from).collect::<Vec<_>>()).unwrap();
        let a = s.subsample(10, &mut Xoshiro256PlusPlus::seed_from_u64(7));
        let b = s.subsample(10, &mut Xoshiro256PlusPlus::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.n_samples(), 10);
    }

    #[test]
    fn test_tail() {
        let s = Sample::from_column(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(s.tail(2).column(0).to_vec(), vec![3.0, 4.0]);
        assert_eq!(s.tail(10).n_samples(), 4);
    }
}
