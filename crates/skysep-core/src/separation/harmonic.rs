//! Internal linear combination on spherical-harmonic coefficients, with
//! weights shared within multipole bins.

use num_complex::Complex64;

use super::ilc::ilc_by_patch;
use super::mask::ValidityMask;
use crate::common::Instrument;
use crate::common::constants::{PI, is_unseen};
use crate::domain::{SepResult, SeparationError, SeparationRecipe};
use crate::model::MixingMatrix;
use crate::numerics::DenseMatrix;
use crate::sky::healpix::reorder;
use crate::sky::{Alm, MapStack, PixelOrdering, SphericalTransform, gauss_beam, npix2nside};

#[derive(Debug, Clone)]
pub struct HarmonicIlcResult {
    /// Weights indexed `[stokes][bin]`, each `(n_comp, n_freq)`.
    pub w: Vec<Vec<DenseMatrix>>,
    /// Coefficient covariance indexed `[stokes][bin]`.
    pub freq_cov: Vec<Vec<DenseMatrix>>,
    /// `(n_comp, stokes, n_pix)`.
    pub s: MapStack,
    /// Input auto spectra `[freq][stokes][l]`, divided by `fsky`.
    pub cl_in: Vec<Vec<Vec<f64>>>,
    /// Output auto spectra `[comp][stokes][l]`, divided by `fsky`.
    pub cl_out: Vec<Vec<Vec<f64>>>,
    pub fsky: f64,
    /// `(2l+1)`-weighted mean multipole of each bin, `Σ l(2l+1) / Σ (2l+1)`
    /// rather than `Σ (2l²+1) / Σ (2l+1)`; NaN for empty bins.
    pub l_ref: Vec<f64>,
}

/// Bin index of `degree` for increasing `edges`: the number of edges not
/// above it.
fn digitize(degree: usize, edges: &[usize]) -> usize {
    edges.partition_point(|&edge| edge <= degree)
}

fn sky_fraction(mask: &ValidityMask, weights: Option<&[f64]>) -> SepResult<f64> {
    let Some(weights) = weights else {
        return Ok(mask.valid_fraction());
    };
    if weights.len() != mask.len() {
        return Err(SeparationError::configuration(
            "CONFIG.APODIZATION",
            format!(
                "apodisation map has {} pixels, data has {}",
                weights.len(),
                mask.len()
            ),
        ));
    }
    let masked_weight = (0..weights.len())
        .find(|&pixel| !mask.is_valid(pixel) && weights[pixel] != 0.0);
    if let Some(pixel) = masked_weight {
        return Err(SeparationError::configuration(
            "CONFIG.APODIZATION",
            format!("weights are non-zero where the data is masked (pixel {pixel})"),
        ));
    }
    let n = weights.len() as f64;
    let second = weights.iter().map(|w| w * w).sum::<f64>() / n;
    let fourth = weights.iter().map(|w| w.powi(4)).sum::<f64>() / n;
    Ok(second * second / fourth)
}

fn validated_edges(lbins: &[usize]) -> SepResult<usize> {
    let Some(&last) = lbins.last() else {
        return Err(SeparationError::configuration(
            "CONFIG.BIN_EDGES",
            "at least one multipole bin edge is required",
        ));
    };
    if lbins.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(SeparationError::configuration(
            "CONFIG.BIN_EDGES",
            "multipole bin edges must be strictly increasing",
        ));
    }
    Ok(last)
}

/// Harmonic-domain ILC.
///
/// Each frequency map (optionally multiplied by `weights`) is analysed up to
/// `min(3 nside - 1, max(lbins))`, beams are deconvolved when the instrument
/// declares any, and the ILC runs independently per Stokes field and per
/// multipole bin on the real and imaginary parts of the coefficients.
/// `weights` are numbered like `data`, and so is the returned `s`.
pub fn harmonic_ilc(
    mixing: &MixingMatrix,
    instrument: &Instrument,
    data: &MapStack,
    lbins: &[usize],
    weights: Option<&[f64]>,
    iterations: usize,
    transform: &dyn SphericalTransform,
) -> SepResult<HarmonicIlcResult> {
    let frequencies = instrument.frequencies()?;
    let n_freq = frequencies.len();
    if n_freq != data.channels() {
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
    let stokes = data.stokes();
    if stokes != 1 && stokes != 3 {
        return Err(SeparationError::configuration(
            "CONFIG.STOKES",
            format!("harmonic ILC takes T or (T, Q, U) maps, got {stokes} Stokes fields"),
        ));
    }
    let n_pix = data.n_pix();
    let nside = npix2nside(n_pix)?;
    let lmax = (3 * nside as usize - 1).min(validated_edges(lbins)?);

    let mask = ValidityMask::unify(&[data])?;
    let fsky = sky_fraction(&mask, weights)?;
    let ordering = data.ordering();
    let data = &data.reordered(PixelOrdering::Nested)?;
    let nested_weights = weights
        .map(|weights| reorder(weights, ordering, PixelOrdering::Nested))
        .transpose()?;
    let weights = nested_weights.as_deref();
    tracing::info!(
        recipe = %SeparationRecipe::HarmonicIlc,
        n_freq,
        stokes,
        nside,
        lmax,
        fsky,
        "starting component separation"
    );

    let beams = match instrument.beams()? {
        Some(beams) if beams.iter().any(|&fwhm| fwhm != 0.0) => {
            if beams.len() != n_freq {
                return Err(SeparationError::configuration(
                    "CONFIG.FREQUENCY_MISMATCH",
                    format!("{} beams for {n_freq} frequencies", beams.len()),
                ));
            }
            Some(beams)
        }
        _ => None,
    };

    tracing::info!("computing alms");
    let sentinel_values = data.to_sentinel_values();
    let mut alms = Vec::with_capacity(n_freq);
    for freq in 0..n_freq {
        let maps: Vec<Vec<f64>> = (0..stokes)
            .map(|s| {
                let start = data.index(freq, s, 0);
                let map = &sentinel_values[start..start + n_pix];
                match weights {
                    Some(weights) => map
                        .iter()
                        .zip(weights)
                        .map(|(&value, &weight)| {
                            if is_unseen(value) {
                                value
                            } else {
                                value * weight
                            }
                        })
                        .collect(),
                    None => map.to_vec(),
                }
            })
            .collect();
        alms.push(transform.map2alm(&maps, lmax, iterations)?);
        tracing::debug!("{} of {} complete", freq + 1, n_freq);
    }

    if let Some(beams) = &beams {
        tracing::info!("correcting alms for the beams");
        for (fwhm_arcmin, freq_alms) in beams.iter().zip(alms.iter_mut()) {
            let window = gauss_beam((fwhm_arcmin / 60.0) * PI / 180.0, lmax);
            for (s, alm) in freq_alms.iter_mut().enumerate() {
                let profile = if s == 0 {
                    &window.temperature
                } else {
                    &window.polarization
                };
                let inverse: Vec<f64> = profile.iter().map(|value| 1.0 / value).collect();
                alm.scale_by_degree(&inverse);
            }
        }
    }

    let spectra_scale = if fsky > 0.0 { 1.0 / fsky } else { 1.0 };
    let cl_in: Vec<Vec<Vec<f64>>> = alms
        .iter()
        .map(|freq_alms| scaled_spectra(freq_alms, spectra_scale))
        .collect();

    tracing::info!("computing ILC");
    let degrees = Alm::degrees(lmax);
    let n_alm = degrees.len();
    let n_bins = digitize(lmax, lbins) + 1;
    let mut samples = Vec::with_capacity(stokes * 2 * n_alm);
    let mut patch_of_sample = Vec::with_capacity(stokes * 2 * n_alm);
    for s in 0..stokes {
        for (index, &degree) in degrees.iter().enumerate() {
            let zero_order = index <= lmax;
            // E and B start at l = 2; in (T, E, B) mode the whole
            // coefficient is dropped, temperature included.
            let excluded = stokes == 3 && degree < 2;
            let bin = s * n_bins + digitize(degree, lbins);
            for imaginary in [false, true] {
                samples.push(
                    alms.iter()
                        .map(|freq_alms| {
                            let value = freq_alms[s].values()[index];
                            if imaginary { value.im } else { value.re }
                        })
                        .collect::<Vec<f64>>(),
                );
                let skip = excluded || (imaginary && zero_order);
                patch_of_sample.push((!skip).then_some(bin));
            }
        }
    }

    let matrix = mixing.eval(&frequencies, &[]);
    let n_comp = matrix.ncols();
    let mut patched = ilc_by_patch(&matrix, &samples, &patch_of_sample, stokes * n_bins)?;
    for (covariance, solved) in patched.freq_cov.iter_mut().zip(&patched.solved) {
        if *solved {
            for row in 0..n_freq {
                for col in 0..n_freq {
                    covariance[(row, col)] *= 2.0;
                }
            }
        }
    }

    tracing::info!("back to real");
    let mut component_alms = Vec::with_capacity(n_comp);
    for comp in 0..n_comp {
        let mut per_stokes = Vec::with_capacity(stokes);
        for s in 0..stokes {
            let mut alm = Alm::zeros(lmax);
            let offset = s * 2 * n_alm;
            for (index, value) in alm.values_mut().iter_mut().enumerate() {
                let part = |sample: usize| {
                    patched.amplitudes[offset + sample]
                        .as_ref()
                        .map_or(0.0, |amplitudes| amplitudes[comp])
                };
                *value = Complex64::new(part(2 * index), part(2 * index + 1));
            }
            per_stokes.push(alm);
        }
        component_alms.push(per_stokes);
    }
    let cl_out = component_alms
        .iter()
        .map(|comp_alms| scaled_spectra(comp_alms, spectra_scale))
        .collect();

    let mut s_values = Vec::with_capacity(n_comp * stokes * n_pix);
    for comp_alms in &component_alms {
        for map in transform.alm2map(comp_alms, nside)? {
            s_values.extend(map);
        }
    }
    let s_maps = MapStack::new(n_comp, stokes, n_pix, s_values)?
        .with_ordering(PixelOrdering::Nested)
        .reordered(ordering)?;

    let mut weight_sum = vec![0.0; n_bins];
    let mut degree_sum = vec![0.0; n_bins];
    for degree in 0..=lmax {
        let bin = digitize(degree, lbins);
        let multiplicity = (2 * degree + 1) as f64;
        weight_sum[bin] += multiplicity;
        degree_sum[bin] += degree as f64 * multiplicity;
    }
    let l_ref = degree_sum
        .iter()
        .zip(&weight_sum)
        .map(|(sum, weight)| if *weight > 0.0 { sum / weight } else { f64::NAN })
        .collect();

    let w = split_by_stokes(patched.w, n_bins);
    let freq_cov = split_by_stokes(patched.freq_cov, n_bins);

    Ok(HarmonicIlcResult {
        w,
        freq_cov,
        s: s_maps,
        cl_in,
        cl_out,
        fsky,
        l_ref,
    })
}

fn scaled_spectra(alms: &[Alm], scale: f64) -> Vec<Vec<f64>> {
    alms.iter()
        .map(|alm| {
            alm.power_spectrum()
                .into_iter()
                .map(|value| value * scale)
                .collect()
        })
        .collect()
}

fn split_by_stokes(matrices: Vec<DenseMatrix>, n_bins: usize) -> Vec<Vec<DenseMatrix>> {
    let mut per_stokes = Vec::new();
    let mut iter = matrices.into_iter().peekable();
    while iter.peek().is_some() {
        per_stokes.push(iter.by_ref().take(n_bins).collect());
    }
    per_stokes
}

#[cfg(test)]
mod tests {
    use super::{digitize, harmonic_ilc};
    use crate::common::constants::{PI, UNSEEN};
    use crate::common::{Instrument, InstrumentRecord};
    use crate::model::{Cmb, MixingMatrix, PowerLaw};
    use crate::numerics::{identity, matmul, max_abs_difference};
    use crate::sky::{DirectTransform, MapStack, PixelOrdering, SphericalTransform, gauss_beam};

    fn instrument() -> Instrument {
        Instrument::Record(InstrumentRecord::new(vec![90.0, 150.0]))
    }

    fn cmb_only() -> MixingMatrix {
        MixingMatrix::new(vec![Box::new(Cmb)])
    }

    fn sky(stokes: usize, n_pix: usize) -> MapStack {
        let mut values = Vec::with_capacity(2 * stokes * n_pix);
        for freq in 0..2 {
            for s in 0..stokes {
                for pixel in 0..n_pix {
                    let signal = ((pixel + 3 * s) as f64 * 0.61).sin();
                    let seed = (freq * 7 + s * 13 + pixel * 31) % 97;
                    values.push(signal + 0.1 * (seed as f64 / 97.0 - 0.5));
                }
            }
        }
        MapStack::new(2, stokes, n_pix, values).expect("sky")
    }

    #[test]
    fn digitize_counts_edges_not_above_the_degree() {
        let edges = [2, 4, 6];
        assert_eq!(digitize(0, &edges), 0);
        assert_eq!(digitize(2, &edges), 1);
        assert_eq!(digitize(5, &edges), 2);
        assert_eq!(digitize(6, &edges), 3);
    }

    #[test]
    fn temperature_bins_are_unbiased_with_reference_multipoles() {
        let result = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &sky(1, 48),
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");

        assert_eq!(result.w.len(), 1);
        assert_eq!(result.w[0].len(), 3);
        for weights in &result.w[0] {
            assert!((weights[(0, 0)] + weights[(0, 1)] - 1.0).abs() < 1.0e-10);
        }
        assert!((result.fsky - 1.0).abs() < 1.0e-15);
        assert!((result.l_ref[0] - 0.75).abs() < 1.0e-12);
        assert!((result.l_ref[1] - 31.0 / 12.0).abs() < 1.0e-12);
        assert!((result.l_ref[2] - 91.0 / 20.0).abs() < 1.0e-12);
        assert_eq!(result.cl_in.len(), 2);
        assert_eq!(result.cl_in[0][0].len(), 6);
        assert_eq!(result.cl_out.len(), 1);
        assert_eq!(result.s.channels(), 1);
        assert_eq!(result.s.n_pix(), 48);
        assert!(result.freq_cov[0][1][(0, 0)] > 0.0);
    }

    #[test]
    fn polarised_maps_drop_low_multipoles_of_every_field() {
        let mut data = sky(3, 48);
        for freq in 0..2 {
            for value in data.map_mut(freq, 0) {
                *value += 5.0;
            }
        }
        let result = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &data,
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");

        assert_eq!(result.w.len(), 3);
        for s in 0..3 {
            assert_eq!(result.w[s][0][(0, 0)], UNSEEN);
            assert_eq!(result.freq_cov[s][0][(1, 1)], UNSEEN);
            assert!((result.w[s][1][(0, 0)] + result.w[s][1][(0, 1)] - 1.0).abs() < 1.0e-10);
        }
        assert!(result.cl_in[0][0][0] > 1.0);
        assert_eq!(result.cl_out[0][0][0], 0.0);
        assert_eq!(result.cl_out[0][0][1], 0.0);
    }

    #[test]
    fn temperature_only_maps_keep_their_monopole() {
        let mut data = sky(1, 48);
        for freq in 0..2 {
            for value in data.map_mut(freq, 0) {
                *value += 5.0;
            }
        }
        let result = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &data,
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");
        assert!(result.cl_out[0][0][0] > 1.0);
    }

    #[test]
    fn beams_are_deconvolved_from_the_coefficients() {
        let data = sky(1, 48);
        let plain = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &data,
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");
        let beamed = Instrument::Record(
            InstrumentRecord::new(vec![90.0, 150.0]).with_beams(vec![600.0, 420.0]),
        );
        let result = harmonic_ilc(
            &cmb_only(),
            &beamed,
            &data,
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc with beams");

        for (freq, fwhm_arcmin) in [600.0_f64, 420.0].into_iter().enumerate() {
            let window = gauss_beam((fwhm_arcmin / 60.0) * PI / 180.0, 5);
            for degree in 0..=5 {
                let expected = plain.cl_in[freq][0][degree] / window.temperature[degree].powi(2);
                let actual = result.cl_in[freq][0][degree];
                assert!(
                    (actual - expected).abs() <= 1.0e-10 * expected.abs().max(1.0),
                    "frequency {freq}, l = {degree}: {actual} vs {expected}"
                );
            }
        }
        for weights in &result.w[0] {
            assert!((weights[(0, 0)] + weights[(0, 1)] - 1.0).abs() < 1.0e-10);
        }
    }

    #[test]
    fn square_mixing_recovers_component_coefficients() {
        let frequencies = [30.0, 150.0];
        let model = MixingMatrix::new(vec![Box::new(Cmb), Box::new(PowerLaw::fixed(30.0, -3.0))]);
        let mixing = model.eval(&frequencies, &[]);
        let n_pix = 48;
        let cmb: Vec<f64> = (0..n_pix).map(|pixel| (pixel as f64 * 0.83).sin() * 3.0).collect();
        let synchrotron: Vec<f64> = (0..n_pix)
            .map(|pixel| 12.0 + (pixel as f64 * 0.29).cos() * 4.0)
            .collect();
        let mut values = Vec::with_capacity(2 * n_pix);
        for freq in 0..2 {
            for pixel in 0..n_pix {
                let seed = ((freq * n_pix + pixel) * 7919) % 1009;
                let noise = 1.0e-6 * (seed as f64 / 1009.0 - 0.5);
                values.push(
                    mixing[(freq, 0)] * cmb[pixel] + mixing[(freq, 1)] * synchrotron[pixel] + noise,
                );
            }
        }
        let data = MapStack::new(2, 1, n_pix, values)
            .expect("sky")
            .with_ordering(PixelOrdering::Nested);
        let instrument = Instrument::Record(InstrumentRecord::new(frequencies.to_vec()));

        let result = harmonic_ilc(
            &model,
            &instrument,
            &data,
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");

        for weights in &result.w[0] {
            assert!(max_abs_difference(&matmul(weights, &mixing), &identity(2)) < 1.0e-8);
        }
        let expected = DirectTransform
            .map2alm(&[cmb], 5, 0)
            .expect("reference coefficients")[0]
            .power_spectrum();
        for (degree, (&actual, &reference)) in result.cl_out[0][0].iter().zip(&expected).enumerate()
        {
            assert!(
                (actual - reference).abs() <= 1.0e-4 * reference.abs() + 1.0e-5,
                "l = {degree}: {actual} vs {reference}"
            );
        }
    }

    #[test]
    fn apodisation_fsky_uses_the_fourth_moment() {
        let weights: Vec<f64> = (0..48).map(|pixel| if pixel < 24 { 1.0 } else { 0.5 }).collect();
        let result = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &sky(1, 48),
            &[2, 4, 6],
            Some(&weights),
            0,
            &DirectTransform,
        )
        .expect("harmonic ilc");
        let expected = 0.625_f64.powi(2) / 0.53125;
        assert!((result.fsky - expected).abs() < 1.0e-12);
    }

    #[test]
    fn weights_on_masked_pixels_are_rejected() {
        let mut data = sky(1, 48);
        data.set(0, 0, 5, UNSEEN);
        let weights = vec![1.0; 48];
        let error = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &data,
            &[2, 4, 6],
            Some(&weights),
            0,
            &DirectTransform,
        )
        .expect_err("masked weight");
        assert_eq!(error.code(), "CONFIG.APODIZATION");
    }

    #[test]
    fn two_stokes_fields_are_rejected() {
        let error = harmonic_ilc(
            &cmb_only(),
            &instrument(),
            &sky(2, 48),
            &[2, 4, 6],
            None,
            0,
            &DirectTransform,
        )
        .expect_err("Q/U only");
        assert_eq!(error.code(), "CONFIG.STOKES");
    }
}
