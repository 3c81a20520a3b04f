//! Small dense linear algebra helpers
//!
//! Inverses of kernel Gram matrices over at most a few hundred centres.

use ndarray::Array2;

/// Matrix inversion using Gauss-Jordan elimination with partial pivoting
pub fn matrix_inverse(m: &Array2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return None;
    }

    // Augmented matrix [M | I]
    let mut aug = Array2::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = m[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        let mut max_row = col;
        for row in col + 1..n {
            if aug[[row, col]].abs() > aug[[max_row, col]].abs() {
                max_row = row;
            }
        }
        if max_row != col {
            for j in 0..2 * n {
                aug.swap([col, j], [max_row, j]);
            }
        }
        if aug[[col, col]].abs() < 1e-12 {
            return None;
        }
        let pivot = aug[[col, col]];
        for j in 0..2 * n {
            aug[[col, j]] /= pivot;
        }
        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                if factor != 0.0 {
                    for j in 0..2 * n {
                        aug[[row, j]] -= factor * aug[[col, j]];
                    }
                }
            }
        }
    }

    let mut inv = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            inv[[i, j]] = aug[[i, n + j]];
        }
    }
    Some(inv)
}

/// Inverse of `H + lambda * I`
///
/// Returns the inverse and the ridge that was finally added; if the matrix is
/// singular at `lambda` the ridge is grown by factors of ten until it inverts.
pub fn regularized_inverse(h: &Array2<f64>, lambda: f64) -> Option<(Array2<f64>, f64)> {
    let n = h.nrows();
    let mut ridge = lambda;
    for _ in 0..8 {
        let mut a = h.clone();
        for k in 0..n {
            a[[k, k]] += ridge;
        }
        if let Some(inv) = matrix_inverse(&a) {
            if inv.iter().all(|v| v.is_finite()) {
                return Some((inv, ridge));
            }
        }
        ridge = if ridge > 0.0 { ridge * 10.0 } else { 1e-10 };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_matrix_inverse() {
        let m = array![[2.0, 0.0], [0.0, 4.0]];
        let inv = matrix_inverse(&m).unwrap();
        assert!((inv[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((inv[[1, 1]] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_singular_inverse_fails() {
        let m = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(matrix_inverse(&m).is_none());
    }

    #[test]
    fn test_regularized_inverse_recovers_singular() {
        let m = array![[1.0, 1.0], [1.0, 1.0]];
        let (inv, ridge) = regularized_inverse(&m, 0.0).unwrap();
        assert!(ridge > 0.0);
        assert!(inv.iter().all(|v| v.is_finite()));
    }
}
