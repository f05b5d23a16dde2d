//! Closed-form pieces of the spectral likelihood.
//!
//! With `Ã = N^{1/2} A` and `d̃ = N^{1/2} d`, amplitudes are
//! `s = (ÃᵀÃ)⁻¹ Ãᵀ d̃` and the whitened residual is `P⊥ d̃`.

use crate::domain::SepResult;
use crate::numerics::{DenseMatrix, LuError, lu_invert, matmul, transpose};

/// Rescale a symmetric positive matrix to unit diagonal.
///
/// Returns the rescaled matrix and the per-row scales `sqrt(m_ii)`.
pub fn correlation(matrix: &DenseMatrix) -> (DenseMatrix, Vec<f64>) {
    let scales: Vec<f64> = (0..matrix.nrows())
        .map(|index| matrix[(index, index)].sqrt())
        .collect();
    let correlation = DenseMatrix::from_fn(matrix.nrows(), matrix.ncols(), |row, col| {
        matrix[(row, col)] / (scales[row] * scales[col])
    });
    (correlation, scales)
}

/// Inverse computed on the unit-diagonal rescaling, which keeps the pivot
/// tests meaningful when diagonal entries span many orders of magnitude.
pub fn equilibrated_inverse(matrix: &DenseMatrix) -> Result<DenseMatrix, LuError> {
    let (correlation, scales) = correlation(matrix);
    let inverse = lu_invert(&correlation)?;
    Ok(DenseMatrix::from_fn(inverse.nrows(), inverse.ncols(), |row, col| {
        inverse[(row, col)] / (scales[row] * scales[col])
    }))
}

/// Unbiased minimum-variance weights `(AᵀC⁻¹A)⁻¹ AᵀC⁻¹`.
pub fn ilc_weights(mixing: &DenseMatrix, inv_cov: &DenseMatrix) -> SepResult<DenseMatrix> {
    let at_inv_cov = matmul(&transpose(mixing), inv_cov);
    let fisher = matmul(&at_inv_cov, mixing);
    Ok(matmul(&equilibrated_inverse(&fisher)?, &at_inv_cov))
}

/// Generalised least-squares projector for one mixing matrix and one
/// diagonal inverse noise.
#[derive(Debug, Clone)]
pub struct Projection {
    whitened: DenseMatrix,
    gram_inverse: DenseMatrix,
}

impl Projection {
    pub fn new(mixing: &DenseMatrix, inv_noise: Option<&[f64]>) -> SepResult<Self> {
        let whitened = match inv_noise {
            Some(weights) => DenseMatrix::from_fn(mixing.nrows(), mixing.ncols(), |row, col| {
                weights[row].sqrt() * mixing[(row, col)]
            }),
            None => mixing.clone(),
        };
        let gram = matmul(&transpose(&whitened), &whitened);
        let gram_inverse = equilibrated_inverse(&gram)?;
        Ok(Self {
            whitened,
            gram_inverse,
        })
    }

    pub fn whitened_mixing(&self) -> &DenseMatrix {
        &self.whitened
    }

    /// `(ÃᵀÃ)⁻¹ Ãᵀ v`.
    pub fn amplitudes(&self, whitened_data: &[f64]) -> Vec<f64> {
        let projected = self.transpose_apply(whitened_data);
        (0..self.gram_inverse.nrows())
            .map(|row| {
                (0..projected.len())
                    .map(|col| self.gram_inverse[(row, col)] * projected[col])
                    .sum::<f64>()
            })
            .collect()
    }

    /// `v - Ã s`.
    pub fn residual(&self, whitened_data: &[f64], amplitudes: &[f64]) -> Vec<f64> {
        let model = self.apply(amplitudes);
        whitened_data
            .iter()
            .zip(model)
            .map(|(value, fitted)| value - fitted)
            .collect()
    }

    /// `P⊥ v`, the part of `v` orthogonal to the columns of `Ã`.
    pub fn complement(&self, vector: &[f64]) -> Vec<f64> {
        let amplitudes = self.amplitudes(vector);
        self.residual(vector, &amplitudes)
    }

    /// Diagonal of `(ÃᵀÃ)⁻¹`.
    pub fn amplitude_variance(&self) -> Vec<f64> {
        (0..self.gram_inverse.nrows())
            .map(|index| self.gram_inverse[(index, index)])
            .collect()
    }

    fn apply(&self, amplitudes: &[f64]) -> Vec<f64> {
        (0..self.whitened.nrows())
            .map(|row| {
                amplitudes
                    .iter()
                    .enumerate()
                    .map(|(col, value)| self.whitened[(row, col)] * value)
                    .sum::<f64>()
            })
            .collect()
    }

    fn transpose_apply(&self, vector: &[f64]) -> Vec<f64> {
        (0..self.whitened.ncols())
            .map(|col| {
                vector
                    .iter()
                    .enumerate()
                    .map(|(row, value)| self.whitened[(row, col)] * value)
                    .sum::<f64>()
            })
            .collect()
    }
}
