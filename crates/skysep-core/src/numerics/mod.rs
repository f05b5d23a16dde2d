pub mod linalg;
pub mod wigner;

pub use linalg::{LuDecomposition, LuError, lu_factorize, lu_invert, lu_solve};
pub use wigner::{LogFactorial, wigner_small_d};

use crate::domain::SeparationError;
use faer::Mat;

pub type DenseMatrix = Mat<f64>;

impl From<LuError> for SeparationError {
    fn from(error: LuError) -> Self {
        SeparationError::numerical("NUMERIC.SINGULAR_MATRIX", error.to_string())
    }
}

pub fn from_rows(rows: &[Vec<f64>]) -> DenseMatrix {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    DenseMatrix::from_fn(nrows, ncols, |row, col| rows[row][col])
}

pub fn identity(size: usize) -> DenseMatrix {
    DenseMatrix::from_fn(size, size, |row, col| if row == col { 1.0 } else { 0.0 })
}

pub fn transpose(matrix: &DenseMatrix) -> DenseMatrix {
    DenseMatrix::from_fn(matrix.ncols(), matrix.nrows(), |row, col| matrix[(col, row)])
}

pub fn matmul(lhs: &DenseMatrix, rhs: &DenseMatrix) -> DenseMatrix {
    debug_assert_eq!(lhs.ncols(), rhs.nrows(), "inner matrix dimensions must match");
    let inner = lhs.ncols();
    DenseMatrix::from_fn(lhs.nrows(), rhs.ncols(), |row, col| {
        (0..inner).map(|k| lhs[(row, k)] * rhs[(k, col)]).sum::<f64>()
    })
}

pub fn matvec(matrix: &DenseMatrix, vector: &[f64]) -> Vec<f64> {
    debug_assert_eq!(matrix.ncols(), vector.len(), "vector length must match columns");
    (0..matrix.nrows())
        .map(|row| {
            vector
                .iter()
                .enumerate()
                .map(|(col, value)| matrix[(row, col)] * value)
                .sum::<f64>()
        })
        .collect()
}

pub fn scale_rows(matrix: &DenseMatrix, factors: &[f64]) -> DenseMatrix {
    debug_assert_eq!(matrix.nrows(), factors.len(), "one factor per row");
    DenseMatrix::from_fn(matrix.nrows(), matrix.ncols(), |row, col| {
        factors[row] * matrix[(row, col)]
    })
}

pub fn filled(nrows: usize, ncols: usize, value: f64) -> DenseMatrix {
    DenseMatrix::from_fn(nrows, ncols, |_, _| value)
}

pub fn diagonal(matrix: &DenseMatrix) -> Vec<f64> {
    (0..matrix.nrows().min(matrix.ncols()))
        .map(|index| matrix[(index, index)])
        .collect()
}

/// Unbiased sample covariance of the rows of `samples` (one column per variable).
pub fn sample_covariance(samples: &DenseMatrix) -> DenseMatrix {
    let n_samples = samples.nrows();
    let n_vars = samples.ncols();
    let means: Vec<f64> = (0..n_vars)
        .map(|col| (0..n_samples).map(|row| samples[(row, col)]).sum::<f64>() / n_samples as f64)
        .collect();
    let denominator = n_samples as f64 - 1.0;

    let mut covariance = DenseMatrix::zeros(n_vars, n_vars);
    for lhs in 0..n_vars {
        for rhs in lhs..n_vars {
            let mut sum = 0.0;
            for row in 0..n_samples {
                sum += (samples[(row, lhs)] - means[lhs]) * (samples[(row, rhs)] - means[rhs]);
            }
            covariance[(lhs, rhs)] = sum / denominator;
            covariance[(rhs, lhs)] = covariance[(lhs, rhs)];
        }
    }
    covariance
}

pub fn max_abs_difference(lhs: &DenseMatrix, rhs: &DenseMatrix) -> f64 {
    let mut best: f64 = 0.0;
    for row in 0..lhs.nrows() {
        for col in 0..lhs.ncols() {
            best = best.max((lhs[(row, col)] - rhs[(row, col)]).abs());
        }
    }
    best
}
