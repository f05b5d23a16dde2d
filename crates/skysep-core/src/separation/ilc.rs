//! Internal linear combination in pixel space.

use std::collections::BTreeMap;

use super::algebra::{correlation, ilc_weights};
use super::mask::ValidityMask;
use crate::common::Instrument;
use crate::common::constants::UNSEEN;
use crate::domain::{SepResult, SeparationError, SeparationRecipe};
use crate::model::MixingMatrix;
use crate::numerics::{DenseMatrix, diagonal, filled, lu_invert, sample_covariance};
use crate::sky::MapStack;

/// Regions over which the weights are computed independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchIds {
    /// One id per pixel, shared by every Stokes map.
    PerPixel(Vec<usize>),
    /// One id per `(stokes, pixel)` entry, Stokes-major.
    PerElement(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct IlcResult {
    /// `(n_comp, n_freq)` weights per patch; `UNSEEN` for empty patches.
    pub w: Vec<DenseMatrix>,
    /// Empirical frequency covariance per patch; `UNSEEN` for empty patches.
    pub freq_cov: Vec<DenseMatrix>,
    /// `(n_comp, stokes, n_pix)`.
    pub s: MapStack,
    pub mask_good: ValidityMask,
}

/// Outcome of the per-patch engine over flat samples.
#[derive(Debug)]
pub(crate) struct PatchedIlc {
    pub w: Vec<DenseMatrix>,
    pub freq_cov: Vec<DenseMatrix>,
    /// Patches that had at least one sample.
    pub solved: Vec<bool>,
    /// Component amplitudes per sample, `None` when the sample had no patch.
    pub amplitudes: Vec<Option<Vec<f64>>>,
}

/// Run the ILC independently on every patch. `patch_of_sample[i] == None`
/// excludes sample `i`; patches without samples keep `UNSEEN` outputs.
pub(crate) fn ilc_by_patch(
    mixing: &DenseMatrix,
    samples: &[Vec<f64>],
    patch_of_sample: &[Option<usize>],
    n_patches: usize,
) -> SepResult<PatchedIlc> {
    let (n_freq, n_comp) = (mixing.nrows(), mixing.ncols());
    let mut result = PatchedIlc {
        w: vec![filled(n_comp, n_freq, UNSEEN); n_patches],
        freq_cov: vec![filled(n_freq, n_freq, UNSEEN); n_patches],
        solved: vec![false; n_patches],
        amplitudes: vec![None; samples.len()],
    };

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, patch) in patch_of_sample.iter().enumerate() {
        if let Some(patch) = patch {
            members.entry(*patch).or_default().push(index);
        }
    }

    for patch in 0..n_patches {
        let Some(indices) = members.get(&patch) else {
            tracing::debug!(patch, "no valid samples, patch skipped");
            continue;
        };
        let patch_data = DenseMatrix::from_fn(indices.len(), n_freq, |row, col| {
            samples[indices[row]][col]
        });
        let covariance = sample_covariance(&patch_data);
        let (correlation, scales) = correlation(&covariance);
        let inverse_correlation = lu_invert(&correlation).map_err(|error| {
            tracing::error!(
                patch,
                samples = indices.len(),
                covariance_diagonal = ?diagonal(&covariance),
                correlation = ?correlation,
                "empirical covariance matrix cannot be reliably inverted"
            );
            SeparationError::numerical(
                "NUMERIC.SINGULAR_COVARIANCE",
                format!("patch {patch}: frequency covariance is not invertible ({error})"),
            )
        })?;
        let inv_freq_cov = DenseMatrix::from_fn(n_freq, n_freq, |row, col| {
            inverse_correlation[(row, col)] / (scales[row] * scales[col])
        });
        let weights = ilc_weights(mixing, &inv_freq_cov)?;

        for &index in indices {
            let amplitudes = (0..n_comp)
                .map(|comp| {
                    (0..n_freq)
                        .map(|freq| weights[(comp, freq)] * samples[index][freq])
                        .sum::<f64>()
                })
                .collect();
            result.amplitudes[index] = Some(amplitudes);
        }
        result.freq_cov[patch] = covariance;
        result.w[patch] = weights;
        result.solved[patch] = true;
    }
    Ok(result)
}

/// Minimum-variance unbiased combination of the frequency maps for a model
/// without free parameters, optionally per patch.
pub fn ilc(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    patch_ids: Option<&PatchIds>,
) -> SepResult<IlcResult> {
    let frequencies = instrument.frequencies()?;
    if frequencies.len() != data.channels() {
        return Err(SeparationError::configuration(
            "CONFIG.FREQUENCY_MISMATCH",
            "the number of frequencies does not match the number of maps provided",
        ));
    }
    if mixing.n_param() != 0 {
        return Err(SeparationError::configuration(
            "CONFIG.FREE_PARAMETERS",
            format!(
                "ILC components must have no free parameters, got {}",
                mixing.n_param()
            ),
        ));
    }
    let (stokes, n_pix) = (data.stokes(), data.n_pix());
    let mask = ValidityMask::unify(&[data])?;

    let element_patch = |s: usize, pixel: usize| -> SepResult<usize> {
        match patch_ids {
            None => Ok(0),
            Some(PatchIds::PerPixel(ids)) => ids.get(pixel).copied().ok_or_else(patch_shape_error),
            Some(PatchIds::PerElement(ids)) => ids
                .get(s * n_pix + pixel)
                .copied()
                .ok_or_else(patch_shape_error),
        }
    };
    let expected_ids = match patch_ids {
        None => 0,
        Some(PatchIds::PerPixel(_)) => n_pix,
        Some(PatchIds::PerElement(_)) => stokes * n_pix,
    };
    if let Some(PatchIds::PerPixel(ids) | PatchIds::PerElement(ids)) = patch_ids
        && ids.len() != expected_ids
    {
        return Err(patch_shape_error());
    }
    let n_patches = match patch_ids {
        None => 1,
        Some(PatchIds::PerPixel(ids) | PatchIds::PerElement(ids)) => {
            ids.iter().copied().max().map_or(0, |max| max + 1)
        }
    };
    tracing::info!(
        recipe = %SeparationRecipe::Ilc,
        n_freq = frequencies.len(),
        stokes,
        n_pix,
        valid = mask.n_valid(),
        n_patches,
        "starting component separation"
    );

    let mut samples = Vec::with_capacity(stokes * n_pix);
    let mut patch_of_sample = Vec::with_capacity(stokes * n_pix);
    for s in 0..stokes {
        for pixel in 0..n_pix {
            samples.push(
                (0..frequencies.len())
                    .map(|freq| data.get(freq, s, pixel))
                    .collect::<Vec<f64>>(),
            );
            patch_of_sample.push(if mask.is_valid(pixel) {
                Some(element_patch(s, pixel)?)
            } else {
                None
            });
        }
    }

    let matrix = mixing.eval(&frequencies, &[]);
    let patched = ilc_by_patch(&matrix, &samples, &patch_of_sample, n_patches)?;

    let n_comp = matrix.ncols();
    let mut s_maps =
        MapStack::filled(n_comp, stokes, n_pix, UNSEEN)?.with_ordering(data.ordering());
    for (index, amplitudes) in patched.amplitudes.iter().enumerate() {
        if let Some(amplitudes) = amplitudes {
            let (s, pixel) = (index / n_pix, index % n_pix);
            for (comp, value) in amplitudes.iter().enumerate() {
                s_maps.set(comp, s, pixel, *value);
            }
        }
    }

    Ok(IlcResult {
        w: patched.w,
        freq_cov: patched.freq_cov,
        s: s_maps,
        mask_good: mask,
    })
}

fn patch_shape_error() -> SeparationError {
    SeparationError::configuration(
        "CONFIG.PATCH_IDS",
        "patch ids must cover every pixel (or every Stokes entry) of the data",
    )
}
