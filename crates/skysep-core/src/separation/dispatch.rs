//! Routing of a prepared fit to one joint solve or one solve per patch, and
//! reshaping of per-sample results back to map layout.

use std::collections::BTreeMap;

use super::mixing::MixingEvaluator;
use super::solver::{ComponentSolver, FitProblem};
use crate::common::constants::UNSEEN;
use crate::domain::SepResult;
use crate::numerics::DenseMatrix;
use crate::sky::MapStack;

#[derive(Debug, Clone)]
pub struct PatchFit {
    pub id: usize,
    pub x: Vec<f64>,
    pub sigma: DenseMatrix,
    pub cost: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// Per-sample results are in the row order of the dispatched problem.
#[derive(Debug, Clone)]
pub struct DispatchedFit {
    pub patches: Vec<PatchFit>,
    pub amplitudes: DenseMatrix,
    pub residuals: DenseMatrix,
    pub amplitude_variance: DenseMatrix,
}

impl DispatchedFit {
    pub fn cost(&self) -> f64 {
        self.patches.iter().map(|patch| patch.cost).sum()
    }

    pub fn converged(&self) -> bool {
        self.patches.iter().all(|patch| patch.converged)
    }

    pub fn iterations(&self) -> usize {
        self.patches
            .iter()
            .map(|patch| patch.iterations)
            .max()
            .unwrap_or(0)
    }
}

/// Fit all samples jointly, or independently per patch id when
/// `patch_of_sample` is given. Patches are solved in increasing id order.
pub fn dispatch_fit(
    problem: &FitProblem,
    evaluator: &dyn MixingEvaluator,
    x0: &[f64],
    patch_of_sample: Option<&[usize]>,
    solver: &dyn ComponentSolver,
) -> SepResult<DispatchedFit> {
    let Some(patch_of_sample) = patch_of_sample else {
        let outcome = solver.solve(problem, evaluator, x0)?;
        tracing::debug!(
            cost = outcome.cost,
            iterations = outcome.iterations,
            "single-patch fit finished"
        );
        return Ok(DispatchedFit {
            patches: vec![PatchFit {
                id: 0,
                x: outcome.x,
                sigma: outcome.sigma,
                cost: outcome.cost,
                converged: outcome.converged,
                iterations: outcome.iterations,
            }],
            amplitudes: outcome.amplitudes,
            residuals: outcome.residuals,
            amplitude_variance: outcome.amplitude_variance,
        });
    };

    let mut rows_by_patch: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &patch) in patch_of_sample.iter().enumerate() {
        rows_by_patch.entry(patch).or_default().push(row);
    }

    let n_comp = evaluator
        .evaluate(x0)?
        .first()
        .map_or(0, |matrix| matrix.ncols());
    let n_samples = problem.n_samples();
    let mut fit = DispatchedFit {
        patches: Vec::with_capacity(rows_by_patch.len()),
        amplitudes: DenseMatrix::zeros(n_samples, n_comp),
        residuals: DenseMatrix::zeros(n_samples, problem.n_freq()),
        amplitude_variance: DenseMatrix::zeros(n_samples, n_comp),
    };

    for (id, rows) in rows_by_patch {
        let outcome = solver.solve(&problem.subset(&rows), evaluator, x0)?;
        tracing::debug!(
            patch = id,
            samples = rows.len(),
            cost = outcome.cost,
            iterations = outcome.iterations,
            "patch fit finished"
        );
        for (local, &row) in rows.iter().enumerate() {
            copy_row(&outcome.amplitudes, local, &mut fit.amplitudes, row);
            copy_row(&outcome.residuals, local, &mut fit.residuals, row);
            copy_row(&outcome.amplitude_variance, local, &mut fit.amplitude_variance, row);
        }
        fit.patches.push(PatchFit {
            id,
            x: outcome.x,
            sigma: outcome.sigma,
            cost: outcome.cost,
            converged: outcome.converged,
            iterations: outcome.iterations,
        });
    }
    Ok(fit)
}

fn copy_row(source: &DenseMatrix, source_row: usize, target: &mut DenseMatrix, target_row: usize) {
    for col in 0..source.ncols() {
        target[(target_row, col)] = source[(source_row, col)];
    }
}

/// Scatter per-sample rows back to `(column, stokes, pixel)` maps.
///
/// Row `k * stokes + s` holds Stokes `s` of `pixels[k]`; every other pixel
/// is `UNSEEN`.
pub fn craft_maps(
    rows: &DenseMatrix,
    pixels: &[usize],
    stokes: usize,
    n_pix: usize,
) -> SepResult<MapStack> {
    let mut maps = MapStack::filled(rows.ncols(), stokes, n_pix, UNSEEN)?;
    for (k, &pixel) in pixels.iter().enumerate() {
        for s in 0..stokes {
            for col in 0..rows.ncols() {
                maps.set(col, s, pixel, rows[(k * stokes + s, col)]);
            }
        }
    }
    Ok(maps)
}
