//! Parametric separation recipes.
//!
//! Every recipe takes frequency maps shaped `(n_freq, stokes, n_pix)` with
//! `stokes` in 1..=3, fits the free parameters of the mixing model and
//! returns maps keyed to the input pixel ordering. Masked pixels and
//! parameter patches without data come back as `UNSEEN`.
//!
//! Fits run on NESTED maps. RING inputs are converted on entry and every
//! pixel-indexed output (including parameter maps at their own resolution)
//! is converted back.

use super::dispatch::{DispatchedFit, craft_maps, dispatch_fit};
use super::mask::ValidityMask;
use super::mixing::{PatchedMixing, Prewhitening};
use super::patches::PatchLayout;
use super::resolution;
use super::solver::{ComponentSolver, FitProblem};
use crate::common::Instrument;
use crate::common::constants::UNSEEN;
use crate::domain::{SepResult, SeparationError, SeparationRecipe};
use crate::model::MixingMatrix;
use crate::numerics::DenseMatrix;
use crate::sky::MapStack;
use crate::sky::healpix::{PixelOrdering, npix2nside, parent_pixel, reorder, ring2nest};

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterCovariance {
    /// `maps[i][j]` is the covariance of parameters `i` and `j` per patch.
    Maps(Vec<Vec<Vec<f64>>>),
    /// One matrix over the flat parameter vector of a multi-resolution fit.
    Joint(DenseMatrix),
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub recipe: SeparationRecipe,
    pub params: Vec<String>,
    /// Best-fit map of each parameter.
    pub x: Vec<Vec<f64>>,
    pub sigma: ParameterCovariance,
    /// Component amplitudes, `(n_comp, stokes, n_pix)`.
    pub s: MapStack,
    /// Noise-weighted residuals, `(n_freq, stokes, n_pix)`.
    pub chi: MapStack,
    /// Diagonal of `(AᵀN⁻¹A)⁻¹`, `(n_comp, stokes, n_pix)`.
    pub amplitude_variance: MapStack,
    pub cost: f64,
    pub converged: bool,
    pub iterations: usize,
    pub mask_good: ValidityMask,
}

impl FitResult {
    /// Relabel the NESTED maps of a fit and renumber them in `ordering`.
    /// `joint_nsides` gives the resolution of each parameter block of a
    /// joint covariance whose patches are HEALPix pixels.
    fn restore_ordering(
        mut self,
        ordering: PixelOrdering,
        joint_nsides: Option<&[u32]>,
    ) -> SepResult<Self> {
        let nested = PixelOrdering::Nested;
        self.s = self.s.with_ordering(nested).reordered(ordering)?;
        self.chi = self.chi.with_ordering(nested).reordered(ordering)?;
        self.amplitude_variance = self
            .amplitude_variance
            .with_ordering(nested)
            .reordered(ordering)?;
        self.mask_good = self.mask_good.reordered(nested, ordering)?;
        for map in &mut self.x {
            *map = reorder_sky(map, ordering)?;
        }
        match &mut self.sigma {
            ParameterCovariance::Maps(maps) => {
                for map in maps.iter_mut().flatten() {
                    *map = reorder_sky(map, ordering)?;
                }
            }
            ParameterCovariance::Joint(sigma) => {
                if let Some(nsides) = joint_nsides {
                    let mut source = Vec::with_capacity(sigma.nrows());
                    for &nside in nsides {
                        let block: Vec<usize> =
                            (source.len()..source.len() + resolution::npix(nside)?).collect();
                        source.extend(reorder_sky(&block, ordering)?);
                    }
                    let nested_sigma = sigma.clone();
                    *sigma = DenseMatrix::from_fn(source.len(), source.len(), |row, col| {
                        nested_sigma[(source[row], source[col])]
                    });
                }
            }
        }
        Ok(self)
    }
}

/// Renumber a NESTED parameter map; single values are left alone.
fn reorder_sky<T: Copy>(map: &[T], ordering: PixelOrdering) -> SepResult<Vec<T>> {
    if map.len() == 1 {
        return Ok(map.to_vec());
    }
    Ok(reorder(map, PixelOrdering::Nested, ordering)?)
}

/// Prewhitened fit with no explicit noise weighting. With `nside > 0` the
/// parameters are fitted independently in every pixel of that resolution.
pub fn basic_comp_sep(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    nside: u32,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    let nested = data.reordered(PixelOrdering::Nested)?;
    basic_nested(mixing, instrument, &nested, nside, solver)?
        .restore_ordering(data.ordering(), None)
}

fn basic_nested(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    nside: u32,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    let frequencies = checked_frequencies(instrument, data)?;
    let mask = ValidityMask::unify(&[data])?;
    let data_nside = resolution::nside_of(data.n_pix())?;
    let patch_nside = checked_patch_nside(nside, data_nside)?;
    tracing::info!(
        recipe = %SeparationRecipe::Basic,
        n_freq = frequencies.len(),
        stokes = data.stokes(),
        n_pix = data.n_pix(),
        valid = mask.n_valid(),
        nside,
        "starting component separation"
    );

    let stokes = data.stokes();
    let n_pix = data.n_pix();
    let prewhitening =
        Prewhitening::from_instrument(instrument, stokes, frequencies.len(), data_nside)?;
    let samples = DenseMatrix::from_fn(n_pix * stokes, frequencies.len(), |row, freq| {
        let (pixel, s) = (row / stokes, row % stokes);
        if !mask.is_valid(pixel) {
            return 0.0;
        }
        let factor = prewhitening.as_ref().map_or(1.0, |pw| pw.row(s)[freq]);
        factor * data.get(freq, s, pixel)
    });

    let evaluator = PatchedMixing::new(
        mixing,
        frequencies,
        prewhitening,
        PatchLayout::global(&mixing.defaults()),
    );
    let cells = (0..n_pix * stokes)
        .map(|row| evaluator.cell_of(0, row % stokes))
        .collect();
    let problem = FitProblem::new(samples, None, cells)?;
    let patch_of_sample = patch_nside.map(|patch_nside| {
        (0..n_pix * stokes)
            .map(|row| parent_pixel(row / stokes, data_nside, patch_nside))
            .collect::<Vec<_>>()
    });

    let fit = dispatch_fit(
        &problem,
        &evaluator,
        &mixing.defaults(),
        patch_of_sample.as_deref(),
        solver,
    )?;

    let all_pixels: Vec<usize> = (0..n_pix).collect();
    let invalid: Vec<bool> = mask.flags().iter().map(|&valid| !valid).collect();
    let x_mask = match patch_nside {
        Some(patch_nside) => Some(resolution::fully_masked(&invalid, patch_nside)?),
        None => None,
    };
    let (x, sigma) = patch_parameters(&fit, mixing.n_param(), patch_nside, x_mask.as_deref())?;

    Ok(FitResult {
        recipe: SeparationRecipe::Basic,
        params: mixing.params(),
        x,
        sigma,
        s: masked_maps(&fit.amplitudes, &all_pixels, stokes, &mask)?,
        chi: masked_maps(&fit.residuals, &all_pixels, stokes, &mask)?,
        amplitude_variance: masked_maps(&fit.amplitude_variance, &all_pixels, stokes, &mask)?,
        cost: fit.cost(),
        converged: fit.converged(),
        iterations: fit.iterations(),
        mask_good: mask,
    })
}

/// Fit weighted by a per-pixel noise variance `cov`, broadcastable to the
/// data (its Stokes and pixel axes may have length 1). Only pixels valid in
/// both `data` and `cov` enter the likelihood. `cov` is numbered like
/// `data`.
pub fn weighted_comp_sep(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    cov: &MapStack,
    nside: u32,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    let nested = data.reordered(PixelOrdering::Nested)?;
    let nested_cov = cov
        .clone()
        .with_ordering(data.ordering())
        .reordered(PixelOrdering::Nested)?;
    weighted_nested(mixing, instrument, &nested, &nested_cov, nside, solver)?
        .restore_ordering(data.ordering(), None)
}

fn weighted_nested(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    cov: &MapStack,
    nside: u32,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    let frequencies = checked_frequencies(instrument, data)?;
    let stokes = data.stokes();
    let n_pix = data.n_pix();
    if cov.channels() != frequencies.len()
        || (cov.stokes() != 1 && cov.stokes() != stokes)
        || (cov.n_pix() != 1 && cov.n_pix() != n_pix)
    {
        return Err(SeparationError::configuration(
            "CONFIG.COVARIANCE_SHAPE",
            format!(
                "covariance ({}, {}, {}) does not broadcast to data ({}, {stokes}, {n_pix})",
                cov.channels(),
                cov.stokes(),
                cov.n_pix(),
                data.channels()
            ),
        ));
    }
    let mask = ValidityMask::unify(&[data, cov])?;
    let data_nside = resolution::nside_of(n_pix)?;
    let patch_nside = checked_patch_nside(nside, data_nside)?;
    tracing::info!(
        recipe = %SeparationRecipe::Weighted,
        n_freq = frequencies.len(),
        stokes,
        n_pix,
        valid = mask.n_valid(),
        nside,
        "starting component separation"
    );

    let valid = mask.valid_indices();
    let n_samples = valid.len() * stokes;
    let samples = DenseMatrix::from_fn(n_samples, frequencies.len(), |row, freq| {
        data.get(freq, row % stokes, valid[row / stokes])
    });
    let inv_noise = DenseMatrix::from_fn(n_samples, frequencies.len(), |row, freq| {
        1.0 / cov.get_broadcast(freq, row % stokes, valid[row / stokes])
    });

    let evaluator = PatchedMixing::new(
        mixing,
        frequencies,
        None,
        PatchLayout::global(&mixing.defaults()),
    );
    let problem = FitProblem::new(samples, Some(inv_noise), vec![0; n_samples])?;
    let patch_of_sample = patch_nside.map(|patch_nside| {
        (0..n_samples)
            .map(|row| parent_pixel(valid[row / stokes], data_nside, patch_nside))
            .collect::<Vec<_>>()
    });

    let fit = dispatch_fit(
        &problem,
        &evaluator,
        &mixing.defaults(),
        patch_of_sample.as_deref(),
        solver,
    )?;
    let (x, sigma) = patch_parameters(&fit, mixing.n_param(), patch_nside, None)?;

    Ok(FitResult {
        recipe: SeparationRecipe::Weighted,
        params: mixing.params(),
        x,
        sigma,
        s: craft_maps(&fit.amplitudes, &valid, stokes, n_pix)?,
        chi: craft_maps(&fit.residuals, &valid, stokes, n_pix)?,
        amplitude_variance: craft_maps(&fit.amplitude_variance, &valid, stokes, n_pix)?,
        cost: fit.cost(),
        converged: fit.converged(),
        iterations: fit.iterations(),
        mask_good: mask,
    })
}

/// Joint fit where parameter `i` is constant over the pixels of `nsides[i]`,
/// or, when `clusters` is given, over each cluster of `clusters[i]`.
/// Cluster pixels are numbered like `data`.
///
/// Noise weighting uses the squared prewhitening factors when the
/// instrument carries sensitivities. All parameters at `nside == 0` reduce
/// to [`basic_comp_sep`].
pub fn multi_res_comp_sep(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    nsides: &[u32],
    clusters: Option<&[Vec<Vec<usize>>]>,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    let nested = data.reordered(PixelOrdering::Nested)?;
    let nested_clusters = match clusters {
        Some(clusters) if data.ordering() == PixelOrdering::Ring => {
            Some(nested_cluster_pixels(clusters, data.n_pix())?)
        }
        Some(clusters) => Some(clusters.to_vec()),
        None => None,
    };
    let joint_nsides = clusters.is_none().then_some(nsides);
    multi_res_nested(
        mixing,
        instrument,
        &nested,
        nsides,
        nested_clusters.as_deref(),
        solver,
    )?
    .restore_ordering(data.ordering(), joint_nsides)
}

/// NESTED indices of RING cluster pixels. Indices outside the map are kept
/// so the layout reports them.
fn nested_cluster_pixels(
    clusters: &[Vec<Vec<usize>>],
    n_pix: usize,
) -> SepResult<Vec<Vec<Vec<usize>>>> {
    let nside = npix2nside(n_pix)?;
    let mut nested = Vec::with_capacity(clusters.len());
    for param_clusters in clusters {
        let mut converted = Vec::with_capacity(param_clusters.len());
        for pixels in param_clusters {
            let mut cluster = Vec::with_capacity(pixels.len());
            for &pixel in pixels {
                cluster.push(if pixel < n_pix {
                    ring2nest(nside, pixel)?
                } else {
                    pixel
                });
            }
            converted.push(cluster);
        }
        nested.push(converted);
    }
    Ok(nested)
}

fn multi_res_nested(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    nsides: &[u32],
    clusters: Option<&[Vec<Vec<usize>>]>,
    solver: &dyn ComponentSolver,
) -> SepResult<FitResult> {
    if nsides.len() != mixing.n_param() {
        return Err(SeparationError::configuration(
            "CONFIG.PARAMETER_COUNT",
            format!(
                "{} free parameters but {} nsides",
                mixing.n_param(),
                nsides.len()
            ),
        ));
    }
    let max_nside = nsides.iter().copied().max().unwrap_or(0);
    if max_nside == 0 {
        return basic_nested(mixing, instrument, data, 0, solver);
    }

    let frequencies = checked_frequencies(instrument, data)?;
    let mask = ValidityMask::unify(&[data])?;
    let stokes = data.stokes();
    let n_pix = data.n_pix();
    let data_nside = npix2nside(n_pix).map_err(|error| {
        SeparationError::configuration(
            "CONFIG.RESOLUTION",
            format!("data has to be a stack of HEALPix maps: {error}"),
        )
    })?;
    tracing::info!(
        recipe = %SeparationRecipe::MultiResolution,
        n_freq = frequencies.len(),
        stokes,
        n_pix,
        valid = mask.n_valid(),
        ?nsides,
        clustered = clusters.is_some(),
        "starting component separation"
    );

    let layout = match clusters {
        Some(clusters) => PatchLayout::clusters(clusters, n_pix, &mixing.defaults(), mask.flags())?,
        None => {
            if max_nside > data_nside {
                return Err(SeparationError::configuration(
                    "CONFIG.RESOLUTION",
                    format!("parameter nside {max_nside} exceeds data nside {data_nside}"),
                ));
            }
            PatchLayout::resolutions(nsides, &mixing.defaults())?
        }
    };
    let spatial_cell = |pixel: usize| {
        if clusters.is_some() {
            pixel
        } else {
            parent_pixel(pixel, data_nside, max_nside)
        }
    };

    let prewhitening =
        Prewhitening::from_instrument(instrument, stokes, frequencies.len(), data_nside)?;
    let n_samples = n_pix * stokes;
    let samples = DenseMatrix::from_fn(n_samples, frequencies.len(), |row, freq| {
        let pixel = row / stokes;
        if mask.is_valid(pixel) {
            data.get(freq, row % stokes, pixel)
        } else {
            0.0
        }
    });
    let inv_noise = prewhitening.as_ref().map(|pw| {
        DenseMatrix::from_fn(n_samples, frequencies.len(), |row, freq| {
            pw.row(row % stokes)[freq].powi(2)
        })
    });
    let cells = (0..n_samples).map(|row| spatial_cell(row / stokes)).collect();
    let x0 = layout.initial_guess();
    let evaluator = PatchedMixing::new(mixing, frequencies, None, layout);
    let problem = FitProblem::new(samples, inv_noise, cells)?;

    let fit = dispatch_fit(&problem, &evaluator, &x0, None, solver)?;
    let patch = fit.patches.first().ok_or_else(|| {
        SeparationError::internal("INTERNAL.FIT_RESULT", "joint fit returned no patch")
    })?;

    let invalid: Vec<bool> = mask.flags().iter().map(|&valid| !valid).collect();
    let mut x = evaluator.layout().to_maps(&patch.x);
    for (map, nside) in x
        .iter_mut()
        .zip(evaluator.layout().reporting_nsides(data_nside))
    {
        let x_mask = resolution::fully_masked(&invalid, nside)?;
        for (value, masked) in map.iter_mut().zip(x_mask) {
            if masked {
                *value = UNSEEN;
            }
        }
    }
    let sigma = DenseMatrix::from_fn(patch.sigma.nrows(), patch.sigma.ncols(), |row, col| {
        nan_to_unseen(patch.sigma[(row, col)])
    });

    let all_pixels: Vec<usize> = (0..n_pix).collect();
    Ok(FitResult {
        recipe: SeparationRecipe::MultiResolution,
        params: mixing.params(),
        x,
        sigma: ParameterCovariance::Joint(sigma),
        s: masked_maps(&fit.amplitudes, &all_pixels, stokes, &mask)?,
        chi: masked_maps(&fit.residuals, &all_pixels, stokes, &mask)?,
        amplitude_variance: masked_maps(&fit.amplitude_variance, &all_pixels, stokes, &mask)?,
        cost: fit.cost(),
        converged: fit.converged(),
        iterations: fit.iterations(),
        mask_good: mask,
    })
}

fn checked_frequencies(instrument: &Instrument, data: &MapStack) -> SepResult<Vec<f64>> {
    let frequencies = instrument.frequencies()?;
    if frequencies.len() != data.channels() {
        return Err(SeparationError::configuration(
            "CONFIG.FREQUENCY_MISMATCH",
            format!(
                "instrument has {} frequencies but {} maps were provided",
                frequencies.len(),
                data.channels()
            ),
        ));
    }
    if !(1..=3).contains(&data.stokes()) {
        return Err(SeparationError::configuration(
            "CONFIG.STOKES",
            format!(
                "data must have 1, 2 or 3 Stokes maps per frequency, got {}",
                data.stokes()
            ),
        ));
    }
    Ok(frequencies)
}

fn checked_patch_nside(nside: u32, data_nside: u32) -> SepResult<Option<u32>> {
    if nside == 0 {
        return Ok(None);
    }
    resolution::npix(nside)?;
    if nside > data_nside {
        return Err(SeparationError::configuration(
            "CONFIG.RESOLUTION",
            format!("patch nside {nside} exceeds data nside {data_nside}"),
        ));
    }
    Ok(Some(nside))
}

fn masked_maps(
    rows: &DenseMatrix,
    pixels: &[usize],
    stokes: usize,
    mask: &ValidityMask,
) -> SepResult<MapStack> {
    let maps = craft_maps(rows, pixels, stokes, mask.len())?;
    Ok(maps.with_pixels_set(|pixel| !mask.is_valid(pixel), UNSEEN))
}

/// Parameter and covariance maps over the patches of `patch_nside` (one
/// value when fitting globally). Patches that were not fitted, that are
/// listed in `x_mask`, or whose values are `NaN` hold `UNSEEN`.
fn patch_parameters(
    fit: &DispatchedFit,
    n_param: usize,
    patch_nside: Option<u32>,
    x_mask: Option<&[bool]>,
) -> SepResult<(Vec<Vec<f64>>, ParameterCovariance)> {
    let n_patches = match patch_nside {
        Some(nside) => resolution::npix(nside)?,
        None => 1,
    };
    let mut x = vec![vec![UNSEEN; n_patches]; n_param];
    let mut sigma = vec![vec![vec![UNSEEN; n_patches]; n_param]; n_param];
    for patch in &fit.patches {
        if patch.id >= n_patches || x_mask.is_some_and(|masked| masked[patch.id]) {
            continue;
        }
        for i in 0..n_param {
            x[i][patch.id] = nan_to_unseen(patch.x[i]);
            for j in 0..n_param {
                sigma[i][j][patch.id] = nan_to_unseen(patch.sigma[(i, j)]);
            }
        }
    }
    Ok((x, ParameterCovariance::Maps(sigma)))
}

fn nan_to_unseen(value: f64) -> f64 {
    if value.is_nan() { UNSEEN } else { value }
}
