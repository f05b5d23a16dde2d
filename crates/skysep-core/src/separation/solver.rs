//! Nonlinear fit of the spectral likelihood.
//!
//! The amplitudes are profiled out in closed form, leaving a least-squares
//! problem in the mixing parameters only: the cost is `½ Σ |P⊥ d̃|²` over
//! every sample. [`LevenbergMarquardtSolver`] is the reference solver; it
//! uses the Kaufman approximation `∂r/∂x_j ≈ -P⊥ ∂Ã_j s`.

use super::algebra::{Projection, equilibrated_inverse};
use super::mixing::MixingEvaluator;
use crate::common::SolverOptions;
use crate::domain::{SepResult, SeparationError};
use crate::numerics::{DenseMatrix, filled, lu_solve};

/// Samples to fit: one row of frequency data per (pixel, Stokes) pair.
#[derive(Debug, Clone)]
pub struct FitProblem {
    data: DenseMatrix,
    inv_noise: Option<DenseMatrix>,
    cell_of_sample: Vec<usize>,
}

impl FitProblem {
    pub fn new(
        data: DenseMatrix,
        inv_noise: Option<DenseMatrix>,
        cell_of_sample: Vec<usize>,
    ) -> SepResult<Self> {
        if cell_of_sample.len() != data.nrows() {
            return Err(SeparationError::internal(
                "INTERNAL.FIT_PROBLEM",
                format!(
                    "{} samples but {} cell assignments",
                    data.nrows(),
                    cell_of_sample.len()
                ),
            ));
        }
        if let Some(weights) = &inv_noise
            && (weights.nrows() != data.nrows() || weights.ncols() != data.ncols())
        {
            return Err(SeparationError::internal(
                "INTERNAL.FIT_PROBLEM",
                "inverse noise must match the data shape",
            ));
        }
        Ok(Self {
            data,
            inv_noise,
            cell_of_sample,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_freq(&self) -> usize {
        self.data.ncols()
    }

    /// Restriction to the given sample rows, in that order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        let pick = |matrix: &DenseMatrix| {
            DenseMatrix::from_fn(rows.len(), matrix.ncols(), |row, col| matrix[(rows[row], col)])
        };
        Self {
            data: pick(&self.data),
            inv_noise: self.inv_noise.as_ref().map(pick),
            cell_of_sample: rows.iter().map(|&row| self.cell_of_sample[row]).collect(),
        }
    }

    fn sample(&self, row: usize) -> Vec<f64> {
        (0..self.data.ncols()).map(|col| self.data[(row, col)]).collect()
    }

    fn weights(&self, row: usize) -> Option<Vec<f64>> {
        self.inv_noise
            .as_ref()
            .map(|weights| (0..weights.ncols()).map(|col| weights[(row, col)]).collect())
    }
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub x: Vec<f64>,
    /// Inverse Fisher matrix of the free parameters; `NaN` rows and columns
    /// for parameters the data does not constrain.
    pub sigma: DenseMatrix,
    /// `(n_samples, n_comp)`.
    pub amplitudes: DenseMatrix,
    /// Noise-weighted residuals, `(n_samples, n_freq)`.
    pub residuals: DenseMatrix,
    /// Diagonal of `(AᵀN⁻¹A)⁻¹` per sample, `(n_samples, n_comp)`.
    pub amplitude_variance: DenseMatrix,
    pub cost: f64,
    pub converged: bool,
    pub iterations: usize,
}

pub trait ComponentSolver {
    fn solve(
        &self,
        problem: &FitProblem,
        evaluator: &dyn MixingEvaluator,
        x0: &[f64],
    ) -> SepResult<FitOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardtSolver {
    options: SolverOptions,
}

impl LevenbergMarquardtSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }
}

struct Linearization {
    cost: f64,
    amplitudes: DenseMatrix,
    residuals: DenseMatrix,
    amplitude_variance: DenseMatrix,
    normal: Option<(DenseMatrix, Vec<f64>)>,
}

impl ComponentSolver for LevenbergMarquardtSolver {
    fn solve(
        &self,
        problem: &FitProblem,
        evaluator: &dyn MixingEvaluator,
        x0: &[f64],
    ) -> SepResult<FitOutcome> {
        let n_free = evaluator.n_free();
        if x0.len() != n_free {
            return Err(SeparationError::internal(
                "INTERNAL.PARAMETER_LENGTH",
                format!("initial guess has {} values for {n_free} parameters", x0.len()),
            ));
        }

        let mut x = x0.to_vec();
        let mut current = linearize(problem, evaluator, &x, n_free > 0)?;
        if n_free == 0 {
            return Ok(finish(x, DenseMatrix::zeros(0, 0), current, true, 0));
        }

        let options = &self.options;
        let mut damping = options.initial_damping;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < options.max_iterations {
            iterations += 1;
            let Some((jtj, jtr)) = current.normal.as_ref() else {
                break;
            };
            let active: Vec<usize> = (0..n_free)
                .filter(|&index| jtj[(index, index)] > 0.0)
                .collect();
            if active.is_empty() {
                converged = true;
                break;
            }

            let mut accepted = None;
            while damping <= options.max_damping {
                if let Some(step) = damped_step(jtj, jtr, &active, damping) {
                    let trial_x: Vec<f64> = x
                        .iter()
                        .zip(&step)
                        .map(|(value, delta)| value + delta)
                        .collect();
                    if let Ok(trial) = linearize(problem, evaluator, &trial_x, false)
                        && trial.cost.is_finite()
                        && trial.cost <= current.cost
                    {
                        accepted = Some((trial_x, step, trial.cost));
                        break;
                    }
                }
                damping *= options.damping_increase;
            }

            let Some((trial_x, step, trial_cost)) = accepted else {
                tracing::debug!(iterations, cost = current.cost, "no descent step left");
                converged = true;
                break;
            };

            let decrease = (current.cost - trial_cost) / current.cost.max(f64::MIN_POSITIVE);
            let step_norm = norm(&step);
            let x_norm = norm(&trial_x);
            x = trial_x;
            current = linearize(problem, evaluator, &x, true)?;
            damping = (damping * options.damping_decrease).max(f64::EPSILON);

            if decrease <= options.cost_tolerance
                || step_norm <= options.parameter_tolerance * (x_norm + options.parameter_tolerance)
            {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::warn!(iterations, cost = current.cost, "fit stopped at the iteration limit");
        }
        let sigma = match current.normal.as_ref() {
            Some((jtj, _)) => parameter_covariance(jtj),
            None => filled(n_free, n_free, f64::NAN),
        };
        Ok(finish(x, sigma, current, converged, iterations))
    }
}

fn finish(
    x: Vec<f64>,
    sigma: DenseMatrix,
    linearization: Linearization,
    converged: bool,
    iterations: usize,
) -> FitOutcome {
    FitOutcome {
        x,
        sigma,
        amplitudes: linearization.amplitudes,
        residuals: linearization.residuals,
        amplitude_variance: linearization.amplitude_variance,
        cost: linearization.cost,
        converged,
        iterations,
    }
}

fn linearize(
    problem: &FitProblem,
    evaluator: &dyn MixingEvaluator,
    x: &[f64],
    with_jacobian: bool,
) -> SepResult<Linearization> {
    let matrices = evaluator.evaluate(x)?;
    if matrices.len() != evaluator.n_cells() {
        return Err(SeparationError::internal(
            "INTERNAL.MIXING_CELLS",
            format!("{} matrices for {} cells", matrices.len(), evaluator.n_cells()),
        ));
    }
    let n_comp = matrices.first().map_or(0, |matrix| matrix.ncols());
    let n_free = evaluator.n_free();

    let derivatives_by_cell = if with_jacobian {
        let mut by_cell: Vec<Vec<(usize, DenseMatrix)>> = vec![Vec::new(); matrices.len()];
        for (flat, derivative) in evaluator.jacobian(x)?.into_iter().enumerate() {
            for (cell, matrix) in derivative {
                by_cell[cell].push((flat, matrix));
            }
        }
        Some(by_cell)
    } else {
        None
    };

    let mut shared: Vec<Option<Projection>> = vec![None; matrices.len()];
    let n_samples = problem.n_samples();
    let mut amplitudes = DenseMatrix::zeros(n_samples, n_comp);
    let mut residuals = DenseMatrix::zeros(n_samples, problem.n_freq());
    let mut amplitude_variance = DenseMatrix::zeros(n_samples, n_comp);
    let mut jtj = DenseMatrix::zeros(n_free, n_free);
    let mut jtr = vec![0.0; n_free];
    let mut cost = 0.0;

    for sample in 0..n_samples {
        let cell = problem.cell_of_sample[sample];
        let weights = problem.weights(sample);
        let owned;
        let projection = match &weights {
            Some(weights) => {
                owned = Projection::new(&matrices[cell], Some(weights.as_slice()))?;
                &owned
            }
            None => {
                if shared[cell].is_none() {
                    shared[cell] = Some(Projection::new(&matrices[cell], None)?);
                }
                shared[cell].as_ref().ok_or_else(|| {
                    SeparationError::internal("INTERNAL.PROJECTION", "projection cache miss")
                })?
            }
        };

        let whitened_data = whiten(&problem.sample(sample), weights.as_deref());
        let s = projection.amplitudes(&whitened_data);
        let residual = projection.residual(&whitened_data, &s);
        cost += 0.5 * residual.iter().map(|value| value * value).sum::<f64>();

        for (comp, (value, variance)) in s.iter().zip(projection.amplitude_variance()).enumerate() {
            amplitudes[(sample, comp)] = *value;
            amplitude_variance[(sample, comp)] = variance;
        }
        for (freq, value) in residual.iter().enumerate() {
            residuals[(sample, freq)] = *value;
        }

        if let Some(by_cell) = &derivatives_by_cell {
            let columns: Vec<(usize, Vec<f64>)> = by_cell[cell]
                .iter()
                .map(|(flat, derivative)| {
                    let direction = whiten(&apply(derivative, &s), weights.as_deref());
                    let column = projection
                        .complement(&direction)
                        .into_iter()
                        .map(|value| -value)
                        .collect();
                    (*flat, column)
                })
                .collect();
            for (lhs, lhs_column) in &columns {
                jtr[*lhs] += dot(lhs_column, &residual);
                for (rhs, rhs_column) in &columns {
                    jtj[(*lhs, *rhs)] += dot(lhs_column, rhs_column);
                }
            }
        }
    }

    Ok(Linearization {
        cost,
        amplitudes,
        residuals,
        amplitude_variance,
        normal: derivatives_by_cell.map(|_| (jtj, jtr)),
    })
}

/// Solve `(JᵀJ + λ diag JᵀJ) δ = -Jᵀr` on the constrained parameters.
fn damped_step(jtj: &DenseMatrix, jtr: &[f64], active: &[usize], damping: f64) -> Option<Vec<f64>> {
    let scales: Vec<f64> = active.iter().map(|&index| jtj[(index, index)].sqrt()).collect();
    let system = DenseMatrix::from_fn(active.len(), active.len(), |row, col| {
        let value = jtj[(active[row], active[col])] / (scales[row] * scales[col]);
        if row == col { value * (1.0 + damping) } else { value }
    });
    let rhs: Vec<f64> = active
        .iter()
        .zip(&scales)
        .map(|(&index, scale)| -jtr[index] / scale)
        .collect();
    let scaled = lu_solve(&system, &rhs).ok()?;

    let mut step = vec![0.0; jtj.nrows()];
    for ((&index, value), scale) in active.iter().zip(scaled).zip(&scales) {
        step[index] = value / scale;
    }
    Some(step)
}

fn parameter_covariance(jtj: &DenseMatrix) -> DenseMatrix {
    let n_free = jtj.nrows();
    let mut sigma = filled(n_free, n_free, f64::NAN);
    let active: Vec<usize> = (0..n_free).filter(|&index| jtj[(index, index)] > 0.0).collect();
    if active.is_empty() {
        return sigma;
    }
    let block = DenseMatrix::from_fn(active.len(), active.len(), |row, col| {
        jtj[(active[row], active[col])]
    });
    match equilibrated_inverse(&block) {
        Ok(inverse) => {
            for (row, &lhs) in active.iter().enumerate() {
                for (col, &rhs) in active.iter().enumerate() {
                    sigma[(lhs, rhs)] = inverse[(row, col)];
                }
            }
        }
        Err(error) => {
            tracing::warn!(%error, "parameter Fisher matrix is not invertible");
        }
    }
    sigma
}

fn whiten(values: &[f64], weights: Option<&[f64]>) -> Vec<f64> {
    match weights {
        Some(weights) => values
            .iter()
            .zip(weights)
            .map(|(value, weight)| weight.sqrt() * value)
            .collect(),
        None => values.to_vec(),
    }
}

fn apply(matrix: &DenseMatrix, vector: &[f64]) -> Vec<f64> {
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

fn dot(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter().zip(rhs).map(|(lhs, rhs)| lhs * rhs).sum()
}

fn norm(values: &[f64]) -> f64 {
    dot(values, values).sqrt()
}
