//! Real dense LU factorisation with partial pivoting.

use super::DenseMatrix;

/// Absolute floor below which a pivot counts as zero.
const SINGULAR_PIVOT: f64 = 1.0e-15;
/// Pivot floor relative to the infinity norm, checked before inverting.
const RELATIVE_PIVOT_FLOOR: f64 = 1.0e-12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LuError {
    #[error("expected a square matrix, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("cannot factorise an empty matrix")]
    EmptyMatrix,
    #[error("entry ({row},{col}) is not finite")]
    NonFiniteEntry { row: usize, col: usize },
    #[error("zero pivot in column {pivot_index}")]
    SingularMatrix { pivot_index: usize },
    #[error("pivot in column {pivot_index} is negligible relative to the matrix norm")]
    IllConditionedMatrix { pivot_index: usize },
    #[error("right-hand side has {actual} entries, expected {expected}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

/// `P A = L U`, with the unit-diagonal `L` stored below the diagonal of `U`
/// in one row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct LuDecomposition {
    n: usize,
    packed: Vec<f64>,
    row_order: Vec<usize>,
    norm_infty: f64,
}

impl LuDecomposition {
    pub fn new(matrix: &DenseMatrix) -> Result<Self, LuError> {
        let n = checked_dimension(matrix)?;
        let mut packed: Vec<f64> = (0..n * n).map(|k| matrix[(k / n, k % n)]).collect();
        let norm_infty = packed
            .chunks(n)
            .map(|row| row.iter().map(|value| value.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        let mut row_order: Vec<usize> = (0..n).collect();

        for k in 0..n {
            let pivot_row = ((k + 1)..n).fold(k, |best, row| {
                if packed[row * n + k].abs() > packed[best * n + k].abs() {
                    row
                } else {
                    best
                }
            });
            if packed[pivot_row * n + k].abs() <= SINGULAR_PIVOT {
                return Err(LuError::SingularMatrix { pivot_index: k });
            }
            if pivot_row != k {
                for col in 0..n {
                    packed.swap(k * n + col, pivot_row * n + col);
                }
                row_order.swap(k, pivot_row);
            }

            let pivot = packed[k * n + k];
            for row in (k + 1)..n {
                let factor = packed[row * n + k] / pivot;
                packed[row * n + k] = factor;
                for col in (k + 1)..n {
                    packed[row * n + col] -= factor * packed[k * n + col];
                }
            }
        }

        Ok(Self {
            n,
            packed,
            row_order,
            norm_infty,
        })
    }

    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Original row index of each factorised row.
    #[cfg(test)]
    fn row_order(&self) -> &[usize] {
        &self.row_order
    }

    fn at(&self, row: usize, col: usize) -> f64 {
        self.packed[row * self.n + col]
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
        let n = self.n;
        if rhs.len() != n {
            return Err(LuError::RhsLengthMismatch {
                expected: n,
                actual: rhs.len(),
            });
        }

        let mut x: Vec<f64> = self.row_order.iter().map(|&row| rhs[row]).collect();
        for row in 1..n {
            let eliminated: f64 = (0..row).map(|col| self.at(row, col) * x[col]).sum();
            x[row] -= eliminated;
        }
        for row in (0..n).rev() {
            let known: f64 = ((row + 1)..n).map(|col| self.at(row, col) * x[col]).sum();
            x[row] = (x[row] - known) / self.at(row, row);
        }
        Ok(x)
    }

    pub fn invert(&self) -> Result<DenseMatrix, LuError> {
        let n = self.n;
        if let Some(pivot_index) =
            (0..n).find(|&k| self.at(k, k).abs() <= self.norm_infty * RELATIVE_PIVOT_FLOOR)
        {
            return Err(LuError::IllConditionedMatrix { pivot_index });
        }

        let mut inverse = DenseMatrix::zeros(n, n);
        let mut unit = vec![0.0; n];
        for col in 0..n {
            unit.fill(0.0);
            unit[col] = 1.0;
            for (row, value) in self.solve(&unit)?.into_iter().enumerate() {
                inverse[(row, col)] = value;
            }
        }
        Ok(inverse)
    }
}

pub fn lu_factorize(matrix: &DenseMatrix) -> Result<LuDecomposition, LuError> {
    LuDecomposition::new(matrix)
}

pub fn lu_solve(matrix: &DenseMatrix, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
    LuDecomposition::new(matrix)?.solve(rhs)
}

pub fn lu_invert(matrix: &DenseMatrix) -> Result<DenseMatrix, LuError> {
    LuDecomposition::new(matrix)?.invert()
}

fn checked_dimension(matrix: &DenseMatrix) -> Result<usize, LuError> {
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    if rows == 0 || cols == 0 {
        return Err(LuError::EmptyMatrix);
    }
    if rows != cols {
        return Err(LuError::NonSquareMatrix { rows, cols });
    }
    for row in 0..rows {
        if let Some(col) = (0..cols).find(|&col| !matrix[(row, col)].is_finite()) {
            return Err(LuError::NonFiniteEntry { row, col });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::{LuDecomposition, LuError, lu_factorize, lu_invert, lu_solve};
    use crate::numerics::{DenseMatrix, from_rows, identity, matmul, matvec, max_abs_difference};

    #[test]
    fn factors_reproduce_the_row_permuted_matrix() {
        let matrix = from_rows(&[
            vec![0.0, 3.0, -1.0],
            vec![2.0, 1.0, 4.0],
            vec![-4.0, 0.5, 2.0],
        ]);
        let lu = lu_factorize(&matrix).expect("factorisation");
        let n = lu.dimension();
        let lower = DenseMatrix::from_fn(n, n, |row, col| match row.cmp(&col) {
            std::cmp::Ordering::Greater => lu.at(row, col),
            std::cmp::Ordering::Equal => 1.0,
            std::cmp::Ordering::Less => 0.0,
        });
        let upper = DenseMatrix::from_fn(n, n, |row, col| {
            if row <= col { lu.at(row, col) } else { 0.0 }
        });
        let permuted = DenseMatrix::from_fn(n, n, |row, col| matrix[(lu.row_order()[row], col)]);

        assert_eq!(lu.row_order()[0], 2);
        assert!(max_abs_difference(&matmul(&lower, &upper), &permuted) < 1.0e-12);
    }

    #[test]
    fn solve_recovers_a_known_vector() {
        let matrix = from_rows(&[
            vec![5.0, 1.0, 0.0],
            vec![1.0, 4.0, 1.0],
            vec![0.0, 1.0, 3.0],
        ]);
        let expected = [0.5, -1.0, 2.0];
        let actual = lu_solve(&matrix, &matvec(&matrix, &expected)).expect("solve");
        for (lhs, rhs) in expected.iter().zip(&actual) {
            assert!((lhs - rhs).abs() < 1.0e-12);
        }
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let matrix = from_rows(&[
            vec![2.0, -1.0, 0.0],
            vec![-1.0, 2.0, -1.0],
            vec![0.0, -1.0, 2.0],
        ]);
        let inverse = lu_invert(&matrix).expect("inverse");
        assert!(max_abs_difference(&matmul(&inverse, &matrix), &identity(3)) < 1.0e-12);
    }

    #[test]
    fn shape_and_value_problems_are_reported() {
        assert_eq!(
            LuDecomposition::new(&DenseMatrix::zeros(3, 2)).expect_err("non-square"),
            LuError::NonSquareMatrix { rows: 3, cols: 2 }
        );
        assert_eq!(
            LuDecomposition::new(&DenseMatrix::zeros(0, 0)).expect_err("empty"),
            LuError::EmptyMatrix
        );
        let with_infinity = from_rows(&[vec![1.0, 0.0], vec![f64::INFINITY, 1.0]]);
        assert_eq!(
            LuDecomposition::new(&with_infinity).expect_err("infinite entry"),
            LuError::NonFiniteEntry { row: 1, col: 0 }
        );
        let lu = lu_factorize(&identity(2)).expect("identity");
        assert_eq!(
            lu.solve(&[1.0]).expect_err("short rhs"),
            LuError::RhsLengthMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn dependent_rows_are_singular() {
        let matrix = from_rows(&[vec![1.0, -3.0], vec![-2.0, 6.0]]);
        assert_eq!(
            lu_factorize(&matrix).expect_err("singular"),
            LuError::SingularMatrix { pivot_index: 1 }
        );
    }

    #[test]
    fn nearly_dependent_rows_factorise_but_do_not_invert() {
        let matrix = from_rows(&[vec![1.0, 1.0], vec![1.0, 1.0 + 1.0e-14]]);
        assert!(lu_factorize(&matrix).is_ok());
        assert_eq!(
            lu_invert(&matrix).expect_err("ill-conditioned"),
            LuError::IllConditionedMatrix { pivot_index: 1 }
        );
    }
}
