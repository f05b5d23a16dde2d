//! Spherical-harmonic transform collaborator.
//!
//! Coefficients use the healpy layout: only `m >= 0` is stored, m-major, so
//! `index(l, m) = m * (2 * lmax + 1 - m) / 2 + l`. Polarised transforms take
//! (T, Q, U) maps and return (T, E, B) coefficients.

use super::healpix::{HealpixError, nside2npix, npix2nside, pix2ang_nest, pixel_area};
use crate::common::constants::{FOUR_PI, is_unseen};
use crate::numerics::{LogFactorial, wigner_small_d};
use num_complex::Complex64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("transforms take 1 (T) or 3 (T, Q, U) maps, got {count}")]
    UnsupportedComponentCount { count: usize },
    #[error("component maps differ in length: {first} vs {other}")]
    LengthMismatch { first: usize, other: usize },
    #[error("coefficient sets must share lmax")]
    LmaxMismatch,
    #[error(transparent)]
    Healpix(#[from] HealpixError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alm {
    lmax: usize,
    values: Vec<Complex64>,
}

impl Alm {
    pub fn zeros(lmax: usize) -> Self {
        Self {
            lmax,
            values: vec![Complex64::new(0.0, 0.0); Self::size(lmax)],
        }
    }

    pub const fn size(lmax: usize) -> usize {
        (lmax + 1) * (lmax + 2) / 2
    }

    pub fn index_of(lmax: usize, degree: usize, order: usize) -> usize {
        order * (2 * lmax + 1 - order) / 2 + degree
    }

    /// Degree of every stored coefficient, in storage order.
    pub fn degrees(lmax: usize) -> Vec<usize> {
        let mut degrees = Vec::with_capacity(Self::size(lmax));
        for order in 0..=lmax {
            degrees.extend(order..=lmax);
        }
        degrees
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn values(&self) -> &[Complex64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Complex64] {
        &mut self.values
    }

    pub fn get(&self, degree: usize, order: usize) -> Complex64 {
        self.values[Self::index_of(self.lmax, degree, order)]
    }

    pub fn set(&mut self, degree: usize, order: usize, value: Complex64) {
        let index = Self::index_of(self.lmax, degree, order);
        self.values[index] = value;
    }

    /// Multiply every coefficient of degree `l` by `factors[l]`.
    pub fn scale_by_degree(&mut self, factors: &[f64]) {
        for (value, degree) in self.values.iter_mut().zip(Self::degrees(self.lmax)) {
            *value *= factors[degree];
        }
    }

    /// Angular power spectrum of a real field.
    pub fn power_spectrum(&self) -> Vec<f64> {
        let mut spectrum = vec![0.0; self.lmax + 1];
        for order in 0..=self.lmax {
            let weight = if order == 0 { 1.0 } else { 2.0 };
            for degree in order..=self.lmax {
                spectrum[degree] += weight * self.get(degree, order).norm_sqr();
            }
        }
        for (degree, value) in spectrum.iter_mut().enumerate() {
            *value /= (2 * degree + 1) as f64;
        }
        spectrum
    }
}

/// Gaussian beam window functions for a given FWHM in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamWindow {
    pub temperature: Vec<f64>,
    pub polarization: Vec<f64>,
}

pub fn gauss_beam(fwhm: f64, lmax: usize) -> BeamWindow {
    let sigma = fwhm / (8.0 * std::f64::consts::LN_2).sqrt();
    let sigma2 = sigma * sigma;
    let temperature: Vec<f64> = (0..=lmax)
        .map(|degree| (-0.5 * (degree * (degree + 1)) as f64 * sigma2).exp())
        .collect();
    let pol_factor = (2.0 * sigma2).exp();
    let polarization = temperature.iter().map(|value| value * pol_factor).collect();
    BeamWindow {
        temperature,
        polarization,
    }
}

pub trait SphericalTransform {
    fn map2alm(
        &self,
        maps: &[Vec<f64>],
        lmax: usize,
        iterations: usize,
    ) -> Result<Vec<Alm>, TransformError>;

    fn alm2map(&self, alms: &[Alm], nside: u32) -> Result<Vec<Vec<f64>>, TransformError>;
}

/// Direct quadrature over NESTED pixel centres.
///
/// Cost grows as `npix * lmax^2`; intended for low resolutions. `UNSEEN`
/// pixels contribute zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTransform;

impl SphericalTransform for DirectTransform {
    fn map2alm(
        &self,
        maps: &[Vec<f64>],
        lmax: usize,
        iterations: usize,
    ) -> Result<Vec<Alm>, TransformError> {
        let n_pix = validate_map_set(maps)?;
        let nside = npix2nside(n_pix)?;
        let geometry = PixelGeometry::new(nside, lmax, maps.len() == 3)?;

        let zero_filled: Vec<Vec<f64>> = maps
            .iter()
            .map(|map| {
                map.iter()
                    .map(|&value| if is_unseen(value) { 0.0 } else { value })
                    .collect()
            })
            .collect();

        let mut alms = geometry.analyse(&zero_filled);
        for _ in 0..iterations {
            let synthesised = geometry.synthesise(&alms);
            let residual: Vec<Vec<f64>> = zero_filled
                .iter()
                .zip(&synthesised)
                .map(|(map, model)| map.iter().zip(model).map(|(lhs, rhs)| lhs - rhs).collect())
                .collect();
            for (alm, correction) in alms.iter_mut().zip(geometry.analyse(&residual)) {
                for (value, delta) in alm.values.iter_mut().zip(correction.values) {
                    *value += delta;
                }
            }
        }
        Ok(alms)
    }

    fn alm2map(&self, alms: &[Alm], nside: u32) -> Result<Vec<Vec<f64>>, TransformError> {
        if alms.len() != 1 && alms.len() != 3 {
            return Err(TransformError::UnsupportedComponentCount { count: alms.len() });
        }
        let lmax = alms[0].lmax;
        if alms.iter().any(|alm| alm.lmax != lmax) {
            return Err(TransformError::LmaxMismatch);
        }
        let geometry = PixelGeometry::new(nside, lmax, alms.len() == 3)?;
        Ok(geometry.synthesise(alms))
    }
}

fn validate_map_set(maps: &[Vec<f64>]) -> Result<usize, TransformError> {
    if maps.len() != 1 && maps.len() != 3 {
        return Err(TransformError::UnsupportedComponentCount { count: maps.len() });
    }
    let first = maps[0].len();
    if let Some(other) = maps.iter().map(Vec::len).find(|&len| len != first) {
        return Err(TransformError::LengthMismatch { first, other });
    }
    Ok(first)
}

struct PixelGeometry {
    lmax: usize,
    area: f64,
    phi: Vec<f64>,
    /// Normalised associated Legendre values, `[pixel][alm index]`.
    spin0: Vec<Vec<f64>>,
    /// `(-1)^m N_l d^l_{m,-2}` and `(-1)^m N_l d^l_{m,2}`, `[pixel][l*l + m + l]`.
    spin2: Option<(Vec<Vec<f64>>, Vec<Vec<f64>>)>,
}

impl PixelGeometry {
    fn new(nside: u32, lmax: usize, polarized: bool) -> Result<Self, HealpixError> {
        let n_pix = nside2npix(nside)?;
        let area = pixel_area(nside)?;
        let mut theta = Vec::with_capacity(n_pix);
        let mut phi = Vec::with_capacity(n_pix);
        for pixel in 0..n_pix {
            let (pixel_theta, pixel_phi) = pix2ang_nest(nside, pixel)?;
            theta.push(pixel_theta);
            phi.push(pixel_phi);
        }

        let spin0 = theta
            .iter()
            .map(|&pixel_theta| {
                let x = pixel_theta.cos();
                let mut row = vec![0.0; Alm::size(lmax)];
                for order in 0..=lmax {
                    for degree in order..=lmax {
                        row[Alm::index_of(lmax, degree, order)] =
                            normalized_legendre(degree, order, x);
                    }
                }
                row
            })
            .collect();

        let spin2 = polarized.then(|| {
            let mut log_factorial = LogFactorial::new();
            let mut plus = Vec::with_capacity(n_pix);
            let mut minus = Vec::with_capacity(n_pix);
            for &pixel_theta in &theta {
                let mut plus_row = vec![0.0; (lmax + 1) * (lmax + 1)];
                let mut minus_row = vec![0.0; (lmax + 1) * (lmax + 1)];
                for degree in 2..=lmax {
                    let norm = ((2 * degree + 1) as f64 / FOUR_PI).sqrt();
                    let l = degree as i32;
                    for order in -l..=l {
                        let slot = full_index(degree, order);
                        let sign = parity(order);
                        plus_row[slot] = sign
                            * norm
                            * wigner_small_d(l, order, -2, pixel_theta, &mut log_factorial);
                        minus_row[slot] = sign
                            * norm
                            * wigner_small_d(l, order, 2, pixel_theta, &mut log_factorial);
                    }
                }
                plus.push(plus_row);
                minus.push(minus_row);
            }
            (plus, minus)
        });

        Ok(Self {
            lmax,
            area,
            phi,
            spin0,
            spin2,
        })
    }

    fn analyse(&self, maps: &[Vec<f64>]) -> Vec<Alm> {
        let mut alms = vec![self.analyse_spin0(&maps[0])];
        if let (Some(tables), [_, q, u]) = (&self.spin2, maps) {
            let (e, b) = self.analyse_spin2(q, u, tables);
            alms.push(e);
            alms.push(b);
        }
        alms
    }

    fn synthesise(&self, alms: &[Alm]) -> Vec<Vec<f64>> {
        let mut maps = vec![self.synthesise_spin0(&alms[0])];
        if let (Some(tables), [_, e, b]) = (&self.spin2, alms) {
            let (q, u) = self.synthesise_spin2(e, b, tables);
            maps.push(q);
            maps.push(u);
        }
        maps
    }

    fn analyse_spin0(&self, map: &[f64]) -> Alm {
        let lmax = self.lmax;
        let mut alm = Alm::zeros(lmax);
        for (pixel, &value) in map.iter().enumerate() {
            if value == 0.0 {
                continue;
            }
            let weight = self.area * value;
            let row = &self.spin0[pixel];
            for order in 0..=lmax {
                let phase = Complex64::from_polar(weight, -(order as f64) * self.phi[pixel]);
                for degree in order..=lmax {
                    let index = Alm::index_of(lmax, degree, order);
                    alm.values[index] += phase * row[index];
                }
            }
        }
        alm
    }

    fn synthesise_spin0(&self, alm: &Alm) -> Vec<f64> {
        let lmax = self.lmax;
        (0..self.phi.len())
            .map(|pixel| {
                let row = &self.spin0[pixel];
                let mut value = 0.0;
                for order in 0..=lmax {
                    let phase = Complex64::from_polar(1.0, (order as f64) * self.phi[pixel]);
                    let weight = if order == 0 { 1.0 } else { 2.0 };
                    for degree in order..=lmax {
                        let index = Alm::index_of(lmax, degree, order);
                        value += weight * (alm.values[index] * phase).re * row[index];
                    }
                }
                value
            })
            .collect()
    }

    fn analyse_spin2(
        &self,
        q: &[f64],
        u: &[f64],
        (plus, minus): &(Vec<Vec<f64>>, Vec<Vec<f64>>),
    ) -> (Alm, Alm) {
        let lmax = self.lmax;
        let mut a_plus = Alm::zeros(lmax);
        let mut a_minus = Alm::zeros(lmax);
        for pixel in 0..q.len() {
            let field_plus = Complex64::new(q[pixel], u[pixel]) * self.area;
            let field_minus = field_plus.conj();
            if field_plus.norm_sqr() == 0.0 {
                continue;
            }
            for order in 0..=lmax {
                let phase = Complex64::from_polar(1.0, -(order as f64) * self.phi[pixel]);
                for degree in order.max(2)..=lmax {
                    let slot = full_index(degree, order as i32);
                    let index = Alm::index_of(lmax, degree, order);
                    a_plus.values[index] += field_plus * phase * plus[pixel][slot];
                    a_minus.values[index] += field_minus * phase * minus[pixel][slot];
                }
            }
        }

        let mut e = Alm::zeros(lmax);
        let mut b = Alm::zeros(lmax);
        for index in 0..Alm::size(lmax) {
            let (ap, am) = (a_plus.values[index], a_minus.values[index]);
            e.values[index] = -(ap + am) * 0.5;
            b.values[index] = Complex64::i() * (ap - am) * 0.5;
        }
        (e, b)
    }

    fn synthesise_spin2(
        &self,
        e: &Alm,
        b: &Alm,
        (plus, _): &(Vec<Vec<f64>>, Vec<Vec<f64>>),
    ) -> (Vec<f64>, Vec<f64>) {
        let lmax = self.lmax;
        let n_pix = self.phi.len();
        let mut q = Vec::with_capacity(n_pix);
        let mut u = Vec::with_capacity(n_pix);
        for pixel in 0..n_pix {
            let mut field = Complex64::new(0.0, 0.0);
            for degree in 2..=lmax {
                let l = degree as i32;
                for order in -l..=l {
                    let stored = order.unsigned_abs() as usize;
                    let (mut e_lm, mut b_lm) = (e.get(degree, stored), b.get(degree, stored));
                    if order < 0 {
                        let sign = parity(order);
                        e_lm = e_lm.conj() * sign;
                        b_lm = b_lm.conj() * sign;
                    }
                    let a_plus = -(e_lm + Complex64::i() * b_lm);
                    let phase = Complex64::from_polar(1.0, f64::from(order) * self.phi[pixel]);
                    field += a_plus * phase * plus[pixel][full_index(degree, order)];
                }
            }
            q.push(field.re);
            u.push(field.im);
        }
        (q, u)
    }
}

fn full_index(degree: usize, order: i32) -> usize {
    degree * degree + (order + degree as i32) as usize
}

fn parity(order: i32) -> f64 {
    if order.rem_euclid(2) == 0 { 1.0 } else { -1.0 }
}

/// `sqrt((2l+1)/(4 pi) (l-m)!/(l+m)!) P_l^m(x)` with the Condon-Shortley phase.
fn normalized_legendre(degree: usize, order: usize, x: f64) -> f64 {
    let normalization =
        (((2 * degree + 1) as f64) * factorial_ratio(degree, order) / FOUR_PI).sqrt();
    normalization * associated_legendre_polynomial(degree, order, x)
}

fn associated_legendre_polynomial(degree: usize, order: usize, x: f64) -> f64 {
    debug_assert!(order <= degree);

    let mut p_mm = 1.0;
    if order > 0 {
        let root = (1.0 - x * x).max(0.0).sqrt();
        for k in 1..=order {
            p_mm *= -((2 * k - 1) as f64) * root;
        }
    }

    if degree == order {
        return p_mm;
    }

    let p_m_plus_1_m = x * ((2 * order + 1) as f64) * p_mm;
    if degree == order + 1 {
        return p_m_plus_1_m;
    }

    let mut p_lm2 = p_mm;
    let mut p_lm1 = p_m_plus_1_m;
    for l in (order + 2)..=degree {
        let numerator = ((2 * l - 1) as f64) * x * p_lm1 - ((l + order - 1) as f64) * p_lm2;
        let p_lm = numerator / ((l - order) as f64);
        p_lm2 = p_lm1;
        p_lm1 = p_lm;
    }

    p_lm1
}

fn factorial_ratio(degree: usize, order: usize) -> f64 {
    let mut ratio = 1.0;
    for term in (degree - order + 1)..=(degree + order) {
        ratio /= term as f64;
    }
    ratio
}

#[cfg(test)]
mod tests {
    use super::{Alm, DirectTransform, SphericalTransform, TransformError, gauss_beam};
    use crate::common::constants::{FOUR_PI, UNSEEN};
    use num_complex::Complex64;

    #[test]
    fn alm_layout_matches_healpy_indexing() {
        assert_eq!(Alm::size(3), 10);
        assert_eq!(Alm::index_of(3, 0, 0), 0);
        assert_eq!(Alm::index_of(3, 3, 0), 3);
        assert_eq!(Alm::index_of(3, 1, 1), 4);
        assert_eq!(Alm::index_of(3, 3, 3), 9);
        assert_eq!(Alm::degrees(2), vec![0, 1, 2, 1, 2, 2]);
    }

    #[test]
    fn monopole_map_has_exact_a00_and_no_dipole() {
        let map = vec![2.0; 48];
        let alms = DirectTransform
            .map2alm(&[map], 3, 0)
            .expect("analysis");
        let expected = 2.0 * FOUR_PI.sqrt();
        assert!((alms[0].get(0, 0).re - expected).abs() < 1.0e-10);
        assert!(alms[0].get(1, 0).norm() < 1.0e-10);
        assert!(alms[0].get(1, 1).norm() < 1.0e-10);
    }

    #[test]
    fn band_limited_temperature_round_trips() {
        let lmax = 5;
        let mut alm = Alm::zeros(lmax);
        alm.set(0, 0, Complex64::new(1.0, 0.0));
        alm.set(2, 0, Complex64::new(-0.5, 0.0));
        alm.set(3, 2, Complex64::new(0.3, -0.7));
        alm.set(5, 5, Complex64::new(0.2, 0.4));

        let maps = DirectTransform.alm2map(&[alm.clone()], 8).expect("synthesis");
        let recovered = DirectTransform
            .map2alm(&maps, lmax, 3)
            .expect("analysis");

        for (expected, actual) in alm.values().iter().zip(recovered[0].values()) {
            assert!(
                (expected - actual).norm() < 1.0e-3,
                "expected {expected} actual {actual}"
            );
        }
    }

    #[test]
    fn band_limited_polarization_round_trips() {
        let lmax = 4;
        let t = Alm::zeros(lmax);
        let mut e = Alm::zeros(lmax);
        let mut b = Alm::zeros(lmax);
        e.set(2, 0, Complex64::new(1.0, 0.0));
        e.set(3, 1, Complex64::new(0.5, 0.25));
        b.set(2, 2, Complex64::new(-0.4, 0.6));

        let maps = DirectTransform
            .alm2map(&[t, e.clone(), b.clone()], 8)
            .expect("synthesis");
        let recovered = DirectTransform.map2alm(&maps, lmax, 3).expect("analysis");

        for (expected, actual) in [(&e, &recovered[1]), (&b, &recovered[2])] {
            for (lhs, rhs) in expected.values().iter().zip(actual.values()) {
                assert!((lhs - rhs).norm() < 1.0e-3, "expected {lhs} actual {rhs}");
            }
        }
    }

    #[test]
    fn unseen_pixels_are_zero_filled() {
        let mut map = vec![1.0; 12];
        map[3] = UNSEEN;
        let alms = DirectTransform.map2alm(&[map], 0, 0).expect("analysis");
        let expected = 11.0 * FOUR_PI / 12.0 / FOUR_PI.sqrt();
        assert!((alms[0].get(0, 0).re - expected).abs() < 1.0e-12);
    }

    #[test]
    fn power_spectrum_counts_negative_orders() {
        let mut alm = Alm::zeros(1);
        alm.set(1, 0, Complex64::new(1.0, 0.0));
        alm.set(1, 1, Complex64::new(0.0, 1.0));
        let spectrum = alm.power_spectrum();
        assert!((spectrum[1] - 1.0).abs() < 1.0e-12);
        assert_eq!(spectrum[0], 0.0);
    }

    #[test]
    fn gaussian_beam_is_unity_at_low_degree() {
        let beam = gauss_beam(30.0_f64.to_radians() / 60.0, 100);
        assert_eq!(beam.temperature[0], 1.0);
        assert!(beam.temperature[100] < beam.temperature[10]);
        assert!(beam.polarization[10] > beam.temperature[10]);
    }

    #[test]
    fn two_map_input_is_rejected() {
        let error = DirectTransform
            .map2alm(&[vec![0.0; 12], vec![0.0; 12]], 2, 0)
            .expect_err("two maps");
        assert_eq!(error, TransformError::UnsupportedComponentCount { count: 2 });
    }
}
