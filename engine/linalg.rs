//! Dense symmetric solves through `faer`, on `ndarray` storage.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),

    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// Borrows contiguous ndarray memory as a faer matrix, copying only when the
/// layout is neither row- nor column-major.
enum MatrixView<'a> {
    Borrowed(MatRef<'a, f64>),
    Copied(Mat<f64>),
}

impl<'a> MatrixView<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                Self::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                Self::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => Self::Copied(Mat::from_fn(rows, cols, |i, j| array[[i, j]])),
        }
    }

    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            Self::Borrowed(view) => *view,
            Self::Copied(mat) => mat.as_ref(),
        }
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
    dim: usize,
}

impl CholeskyFactor {
    /// Solves `A X = B`.
    pub fn solve(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let view = MatrixView::new(rhs);
        let solution = self.factor.solve(view.as_ref());
        Array2::from_shape_fn((solution.nrows(), solution.ncols()), |(i, j)| {
            solution[(i, j)]
        })
    }

    /// `A^{-1}`, symmetrised to remove rounding asymmetry.
    pub fn inverse(&self) -> Array2<f64> {
        let mut inverse = self.solve(&Array2::eye(self.dim));
        for i in 0..self.dim {
            for j in 0..i {
                let mean = 0.5 * (inverse[[i, j]] + inverse[[j, i]]);
                inverse[[i, j]] = mean;
                inverse[[j, i]] = mean;
            }
        }
        inverse
    }
}

pub trait Cholesky {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> Cholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(LinalgError::NotSquare { rows, cols });
        }
        let factor = MatrixView::new(self)
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor, dim: rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn inverse_times_matrix_is_identity() -> Result<(), LinalgError> {
        let a = array![[4.0, 1.0, 0.2], [1.0, 3.0, 0.5], [0.2, 0.5, 2.0]];
        let inverse = a.cholesky()?.inverse();
        let product = a.dot(&inverse);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(a.cholesky(), Err(LinalgError::Cholesky(_))));
    }

    #[test]
    fn transposed_storage_is_handled() -> Result<(), LinalgError> {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let transposed = a.t();
        let solved = transposed.cholesky()?.solve(&array![[1.0], [0.0]]);
        assert_abs_diff_eq!(2.0 * solved[[0, 0]] + 0.5 * solved[[1, 0]], 1.0, epsilon = 1e-12);
        Ok(())
    }
}
