//! Mixing-matrix evaluation as seen by the solver.

use super::patches::PatchLayout;
use crate::common::Instrument;
use crate::common::constants::ARCMIN_PER_RADIAN;
use crate::domain::{SepResult, SeparationError};
use crate::model::MixingMatrix;
use crate::numerics::{DenseMatrix, scale_rows};
use crate::sky::healpix::nside2resol;

/// Derivative of the cell matrices with respect to one flat parameter:
/// `(cell, dA/dx_j)` for every cell the parameter touches.
pub type ParameterDerivative = Vec<(usize, DenseMatrix)>;

pub trait MixingEvaluator {
    fn n_free(&self) -> usize;

    fn n_cells(&self) -> usize;

    /// Mixing matrix of every cell.
    fn evaluate(&self, x: &[f64]) -> SepResult<Vec<DenseMatrix>>;

    /// One entry per flat parameter.
    fn jacobian(&self, x: &[f64]) -> SepResult<Vec<ParameterDerivative>>;
}

/// Per-frequency noise scaling, one row per distinct Stokes treatment.
#[derive(Debug, Clone, PartialEq)]
pub struct Prewhitening {
    rows: Vec<Vec<f64>>,
}

impl Prewhitening {
    /// Factors `pixel size in arcmin / sensitivity`, choosing `Sens_I` for
    /// temperature, `Sens_P` for polarisation and both for (I, Q, U). A
    /// missing sensitivity disables prewhitening.
    pub fn from_instrument(
        instrument: &Instrument,
        stokes: usize,
        n_freq: usize,
        data_nside: u32,
    ) -> SepResult<Option<Self>> {
        let sensitivities = match stokes {
            1 => instrument.sens_i()?.map(|sens| vec![sens]),
            2 => instrument.sens_p()?.map(|sens| vec![sens]),
            3 => match (instrument.sens_i()?, instrument.sens_p()?) {
                (Some(sens_i), Some(sens_p)) => Some(vec![sens_i, sens_p.clone(), sens_p]),
                _ => None,
            },
            other => {
                return Err(SeparationError::configuration(
                    "CONFIG.STOKES",
                    format!("data must have 1, 2 or 3 Stokes maps per frequency, got {other}"),
                ));
            }
        };
        let Some(sensitivities) = sensitivities else {
            return Ok(None);
        };

        let pixel_arcmin = if data_nside == 0 {
            12.0_f64.sqrt() * nside2resol(1)? * ARCMIN_PER_RADIAN
        } else {
            nside2resol(data_nside)? * ARCMIN_PER_RADIAN
        };

        let mut rows = Vec::with_capacity(sensitivities.len());
        for sens in sensitivities {
            if sens.len() != n_freq {
                return Err(SeparationError::configuration(
                    "CONFIG.FREQUENCY_MISMATCH",
                    format!("{} sensitivities for {n_freq} frequencies", sens.len()),
                ));
            }
            if sens.iter().any(|value| !value.is_finite()) {
                return Err(SeparationError::configuration(
                    "CONFIG.SENSITIVITY",
                    "instrument sensitivities must be finite",
                ));
            }
            rows.push(sens.iter().map(|value| pixel_arcmin / value).collect());
        }
        Ok(Some(Self { rows }))
    }

    #[cfg(test)]
    pub(crate) fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        Self { rows }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Factors for the given Stokes index.
    pub fn row(&self, stokes: usize) -> &[f64] {
        if self.rows.len() == 1 {
            &self.rows[0]
        } else {
            &self.rows[stokes]
        }
    }
}

/// The component model evaluated at the instrument frequencies, spread over
/// the cells of a [`PatchLayout`] and optionally prewhitened.
///
/// Cell `c * n_rows + r` is spatial cell `c` under prewhitening row `r`.
pub struct PatchedMixing<'a> {
    mixing: &'a MixingMatrix,
    frequencies: Vec<f64>,
    prewhitening: Option<Prewhitening>,
    layout: PatchLayout,
}

impl<'a> PatchedMixing<'a> {
    pub fn new(
        mixing: &'a MixingMatrix,
        frequencies: Vec<f64>,
        prewhitening: Option<Prewhitening>,
        layout: PatchLayout,
    ) -> Self {
        Self {
            mixing,
            frequencies,
            prewhitening,
            layout,
        }
    }

    pub fn layout(&self) -> &PatchLayout {
        &self.layout
    }

    pub fn n_rows(&self) -> usize {
        self.prewhitening.as_ref().map_or(1, Prewhitening::n_rows)
    }

    pub fn cell_of(&self, spatial_cell: usize, stokes: usize) -> usize {
        let n_rows = self.n_rows();
        let row = if n_rows == 1 { 0 } else { stokes };
        spatial_cell * n_rows + row
    }

    fn whiten(&self, matrix: DenseMatrix, row: usize) -> DenseMatrix {
        match &self.prewhitening {
            Some(prewhitening) => scale_rows(&matrix, prewhitening.row(row)),
            None => matrix,
        }
    }
}

impl MixingEvaluator for PatchedMixing<'_> {
    fn n_free(&self) -> usize {
        self.layout.n_free()
    }

    fn n_cells(&self) -> usize {
        self.layout.n_cells() * self.n_rows()
    }

    fn evaluate(&self, x: &[f64]) -> SepResult<Vec<DenseMatrix>> {
        check_length(x, self.n_free())?;
        let n_rows = self.n_rows();
        let mut matrices = Vec::with_capacity(self.n_cells());
        for cell in 0..self.layout.n_cells() {
            let matrix = self
                .mixing
                .eval(&self.frequencies, &self.layout.cell_params(x, cell));
            for row in 0..n_rows {
                matrices.push(self.whiten(matrix.clone(), row));
            }
        }
        Ok(matrices)
    }

    fn jacobian(&self, x: &[f64]) -> SepResult<Vec<ParameterDerivative>> {
        check_length(x, self.n_free())?;
        let n_rows = self.n_rows();
        let mut derivatives: Vec<ParameterDerivative> = vec![Vec::new(); self.n_free()];
        for cell in 0..self.layout.n_cells() {
            let params = self.layout.cell_params(x, cell);
            let cell_derivatives = self.mixing.diff(&self.frequencies, &params);
            for (param, derivative) in cell_derivatives.into_iter().enumerate() {
                let Some(flat) = self.layout.flat_index(param, cell) else {
                    continue;
                };
                for row in 0..n_rows {
                    derivatives[flat].push((cell * n_rows + row, self.whiten(derivative.clone(), row)));
                }
            }
        }
        Ok(derivatives)
    }
}

fn check_length(x: &[f64], expected: usize) -> SepResult<()> {
    if x.len() != expected {
        return Err(SeparationError::internal(
            "INTERNAL.PARAMETER_LENGTH",
            format!("expected {expected} parameters, got {}", x.len()),
        ));
    }
    Ok(())
}
