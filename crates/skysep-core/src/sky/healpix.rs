//! HEALPix pixelisation primitives.
//!
//! Grading and pixel centres work on NESTED maps, where the children of a
//! pixel are a contiguous index range. RING maps are converted with
//! [`reorder`] at the boundary.

use crate::common::constants::{FOUR_PI, PI, UNSEEN, is_unseen};

pub const MAX_ORDER: u32 = 29;
pub const BASE_PIXELS: usize = 12;

const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Pixel numbering scheme of a full-sky map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrdering {
    /// Iso-latitude rings from north to south.
    #[default]
    Ring,
    /// Hierarchical numbering within the twelve base pixels.
    Nested,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealpixError {
    #[error("nside {nside} is not a power of two in [1, 2^{MAX_ORDER}]")]
    InvalidNside { nside: u32 },
    #[error("{npix} pixels do not form a HEALPix map")]
    InvalidPixelCount { npix: usize },
    #[error("pixel index {pixel} out of range for nside {nside}")]
    PixelOutOfRange { pixel: usize, nside: u32 },
}

pub fn is_valid_nside(nside: u32) -> bool {
    nside >= 1 && nside.is_power_of_two() && nside.trailing_zeros() <= MAX_ORDER
}

pub fn validate_nside(nside: u32) -> Result<u32, HealpixError> {
    if is_valid_nside(nside) {
        Ok(nside)
    } else {
        Err(HealpixError::InvalidNside { nside })
    }
}

pub fn nside2order(nside: u32) -> Result<u32, HealpixError> {
    Ok(validate_nside(nside)?.trailing_zeros())
}

pub fn nside2npix(nside: u32) -> Result<usize, HealpixError> {
    let nside = validate_nside(nside)? as usize;
    Ok(BASE_PIXELS * nside * nside)
}

pub fn npix2nside(npix: usize) -> Result<u32, HealpixError> {
    let invalid = HealpixError::InvalidPixelCount { npix };
    if npix == 0 || npix % BASE_PIXELS != 0 {
        return Err(invalid);
    }
    let per_face = npix / BASE_PIXELS;
    let nside = (per_face as f64).sqrt().round() as usize;
    if nside * nside != per_face || !is_valid_nside(nside as u32) {
        return Err(invalid);
    }
    Ok(nside as u32)
}

pub fn pixel_area(nside: u32) -> Result<f64, HealpixError> {
    Ok(FOUR_PI / nside2npix(nside)? as f64)
}

/// Approximate pixel side length in radians.
pub fn nside2resol(nside: u32) -> Result<f64, HealpixError> {
    Ok(pixel_area(nside)?.sqrt())
}

/// Index of the pixel at `nside_out` containing `pixel` at `nside_in`.
/// Requires `nside_out <= nside_in`, both valid.
pub fn parent_pixel(pixel: usize, nside_in: u32, nside_out: u32) -> usize {
    let shift = 2 * (nside_in.trailing_zeros() - nside_out.trailing_zeros());
    pixel >> shift
}

/// Where a NESTED pixel sits in the ring scheme.
struct RingPosition {
    /// Ring number counted from the north pole, starting at 1.
    ring: i64,
    /// Pixels in the ring divided by four.
    ring_pixels: i64,
    /// Position along the ring, starting at 1.
    phi_index: i64,
    /// 1 when the ring is offset by half a pixel.
    shift: i64,
}

fn ring_position(nside: u32, pixel: usize) -> RingPosition {
    let order = nside.trailing_zeros();
    let face = pixel >> (2 * order);
    let in_face = pixel & ((1usize << (2 * order)) - 1);
    let ix = compress_bits(in_face) as i64;
    let iy = compress_bits(in_face >> 1) as i64;

    let nside = i64::from(nside);
    let nl4 = 4 * nside;
    let ring = JRLL[face] * nside - ix - iy - 1;
    let (ring_pixels, shift) = if ring < nside {
        (ring, 0)
    } else if ring > 3 * nside {
        (nl4 - ring, 0)
    } else {
        (nside, (ring - nside) & 1)
    };

    let mut phi_index = (JPLL[face] * ring_pixels + ix - iy + 1 + shift) / 2;
    if phi_index > nl4 {
        phi_index -= nl4;
    }
    if phi_index < 1 {
        phi_index += nl4;
    }
    RingPosition {
        ring,
        ring_pixels,
        phi_index,
        shift,
    }
}

fn check_pixel(nside: u32, pixel: usize) -> Result<usize, HealpixError> {
    let npix = nside2npix(nside)?;
    if pixel >= npix {
        return Err(HealpixError::PixelOutOfRange { pixel, nside });
    }
    Ok(npix)
}

/// Colatitude and longitude of the centre of a NESTED pixel.
pub fn pix2ang_nest(nside: u32, pixel: usize) -> Result<(f64, f64), HealpixError> {
    check_pixel(nside, pixel)?;
    let position = ring_position(nside, pixel);
    let n = i64::from(nside);
    let fact = 1.0 / (3.0 * (n * n) as f64);
    let nr = position.ring_pixels;

    let z = if position.ring < n {
        1.0 - (nr * nr) as f64 * fact
    } else if position.ring > 3 * n {
        (nr * nr) as f64 * fact - 1.0
    } else {
        ((2 * n - position.ring) * 2) as f64 / (3 * n) as f64
    };
    let phi = (position.phi_index as f64 - (position.shift + 1) as f64 * 0.5)
        * (0.5 * PI / nr as f64);
    Ok((z.clamp(-1.0, 1.0).acos(), phi))
}

/// RING index of a NESTED pixel.
pub fn nest2ring(nside: u32, pixel: usize) -> Result<usize, HealpixError> {
    let npix = check_pixel(nside, pixel)? as i64;
    let position = ring_position(nside, pixel);
    let n = i64::from(nside);
    let polar_cap = 2 * n * (n - 1);
    let nr = position.ring_pixels;

    let ring_start = if position.ring < n {
        2 * nr * (nr - 1)
    } else if position.ring > 3 * n {
        npix - 2 * nr * (nr + 1)
    } else {
        polar_cap + (position.ring - n) * 4 * n
    };
    Ok((ring_start + position.phi_index - 1) as usize)
}

/// NESTED index of a RING pixel.
pub fn ring2nest(nside: u32, pixel: usize) -> Result<usize, HealpixError> {
    let npix = check_pixel(nside, pixel)? as i64;
    let order = nside.trailing_zeros();
    let n = i64::from(nside);
    let (nl2, nl4) = (2 * n, 4 * n);
    let polar_cap = 2 * n * (n - 1);
    let pix = pixel as i64;

    let (ring, phi_index, ring_pixels, shift, face) = if pix < polar_cap {
        let ring = (1 + isqrt(1 + 2 * pix)) >> 1;
        let phi_index = pix + 1 - 2 * ring * (ring - 1);
        (ring, phi_index, ring, 0, (phi_index - 1) / ring)
    } else if pix < npix - polar_cap {
        let offset = pix - polar_cap;
        let band = offset / nl4;
        let ring = band + n;
        let phi_index = offset - band * nl4 + 1;
        let shift = (ring + n) & 1;
        let ascending = band + 1;
        let descending = nl2 + 2 - ascending;
        let face_m = (phi_index - (ascending >> 1) + n - 1) / n;
        let face_p = (phi_index - (descending >> 1) + n - 1) / n;
        let face = match face_p.cmp(&face_m) {
            std::cmp::Ordering::Equal => face_p | 4,
            std::cmp::Ordering::Less => face_p,
            std::cmp::Ordering::Greater => face_m + 8,
        };
        (ring, phi_index, n, shift, face)
    } else {
        let from_end = npix - pix;
        let south_ring = (1 + isqrt(2 * from_end - 1)) >> 1;
        let phi_index = 4 * south_ring + 1 - (from_end - 2 * south_ring * (south_ring - 1));
        let face = (phi_index - 1) / south_ring + 8;
        (2 * nl2 - south_ring, phi_index, south_ring, 0, face)
    };

    let face = face as usize;
    let row = ring - JRLL[face] * n + 1;
    let mut column = 2 * phi_index - JPLL[face] * ring_pixels - shift - 1;
    if column >= nl2 {
        column -= 8 * n;
    }
    let ix = ((column - row) >> 1) as usize;
    let iy = ((-column - row) >> 1) as usize;
    Ok((face << (2 * order)) + spread_bits(ix) + (spread_bits(iy) << 1))
}

/// Express a full-sky map given in `from` ordering in `to` ordering.
pub fn reorder<T: Copy>(
    map: &[T],
    from: PixelOrdering,
    to: PixelOrdering,
) -> Result<Vec<T>, HealpixError> {
    if from == to {
        return Ok(map.to_vec());
    }
    let nside = npix2nside(map.len())?;
    let mut reordered = map.to_vec();
    for (pixel, &value) in map.iter().enumerate() {
        let target = match to {
            PixelOrdering::Nested => ring2nest(nside, pixel)?,
            PixelOrdering::Ring => nest2ring(nside, pixel)?,
        };
        reordered[target] = value;
    }
    Ok(reordered)
}

/// Change the resolution of a NESTED map.
///
/// Upgrading replicates each value over its children. Downgrading averages
/// the children; `UNSEEN` children are skipped unless `pessimistic`, in which
/// case any `UNSEEN` child makes the parent `UNSEEN`.
pub fn ud_grade(map: &[f64], nside_out: u32, pessimistic: bool) -> Result<Vec<f64>, HealpixError> {
    let nside_in = npix2nside(map.len())?;
    validate_nside(nside_out)?;

    if nside_out == nside_in {
        return Ok(map.to_vec());
    }

    if nside_out > nside_in {
        let ratio = (nside_out / nside_in) as usize;
        let children = ratio * ratio;
        let mut upgraded = Vec::with_capacity(map.len() * children);
        for &value in map {
            upgraded.extend(std::iter::repeat_n(value, children));
        }
        return Ok(upgraded);
    }

    let ratio = (nside_in / nside_out) as usize;
    let children = ratio * ratio;
    Ok(map
        .chunks(children)
        .map(|block| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for &value in block {
                if is_unseen(value) {
                    if pessimistic {
                        return UNSEEN;
                    }
                    continue;
                }
                sum += value;
                count += 1;
            }
            if count == 0 { UNSEEN } else { sum / count as f64 }
        })
        .collect())
}

fn isqrt(value: i64) -> i64 {
    let mut root = (value as f64).sqrt() as i64;
    while root * root > value {
        root -= 1;
    }
    while (root + 1) * (root + 1) <= value {
        root += 1;
    }
    root
}

fn spread_bits(value: usize) -> usize {
    let mut result = 0usize;
    let mut bit = 0;
    let mut rest = value;
    while rest != 0 {
        result |= (rest & 1) << (2 * bit);
        rest >>= 1;
        bit += 1;
    }
    result
}

fn compress_bits(value: usize) -> usize {
    let mut result = 0usize;
    let mut bit = 0;
    let mut rest = value;
    while rest != 0 {
        result |= (rest & 1) << bit;
        rest >>= 2;
        bit += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::{
        HealpixError, PixelOrdering, nest2ring, npix2nside, nside2npix, nside2resol, parent_pixel,
        pix2ang_nest, reorder, ring2nest, ud_grade,
    };
    use crate::common::constants::{PI, UNSEEN};

    #[test]
    fn pixel_counts_round_trip() {
        for nside in [1, 2, 4, 8, 64] {
            let npix = nside2npix(nside).expect("npix");
            assert_eq!(npix, 12 * (nside as usize).pow(2));
            assert_eq!(npix2nside(npix).expect("nside"), nside);
        }
        assert_eq!(
            nside2npix(3).expect_err("3 is not a power of two"),
            HealpixError::InvalidNside { nside: 3 }
        );
        assert_eq!(
            npix2nside(13).expect_err("13 pixels"),
            HealpixError::InvalidPixelCount { npix: 13 }
        );
        assert!(npix2nside(12 * 9).is_err());
    }

    #[test]
    fn resolution_matches_pixel_area() {
        let resol = nside2resol(1).expect("resol");
        assert!((resol * resol * 12.0 - 4.0 * PI).abs() < 1.0e-12);
    }

    #[test]
    fn base_pixel_centres_match_reference_values() {
        let (theta, phi) = pix2ang_nest(1, 0).expect("pixel 0");
        assert!((theta - (2.0_f64 / 3.0).acos()).abs() < 1.0e-12);
        assert!((phi - PI / 4.0).abs() < 1.0e-12);

        let (theta, phi) = pix2ang_nest(1, 4).expect("pixel 4");
        assert!((theta - PI / 2.0).abs() < 1.0e-12);
        assert!(phi.abs() < 1.0e-12);

        let (theta, _) = pix2ang_nest(1, 11).expect("pixel 11");
        assert!((theta - (-2.0_f64 / 3.0).acos()).abs() < 1.0e-12);
    }

    #[test]
    fn pixel_centres_cover_sphere_with_zero_mean_direction() {
        let nside = 4;
        let npix = nside2npix(nside).expect("npix");
        let mut sum = [0.0; 3];
        for pixel in 0..npix {
            let (theta, phi) = pix2ang_nest(nside, pixel).expect("angle");
            sum[0] += theta.sin() * phi.cos();
            sum[1] += theta.sin() * phi.sin();
            sum[2] += theta.cos();
        }
        for component in sum {
            assert!(component.abs() < 1.0e-9, "sum {component}");
        }
    }

    #[test]
    fn children_share_parent_region() {
        let (theta_parent, _) = pix2ang_nest(1, 5).expect("parent");
        for child in 5 * 16..6 * 16 {
            assert_eq!(parent_pixel(child, 4, 1), 5);
            let (theta_child, _) = pix2ang_nest(4, child).expect("child");
            assert!((theta_child - theta_parent).abs() < 0.8);
        }
    }

    #[test]
    fn ud_grade_averages_valid_children() {
        let mut map: Vec<f64> = (0..48).map(|value| value as f64).collect();
        map[1] = UNSEEN;
        map[4..8].fill(UNSEEN);

        let optimistic = ud_grade(&map, 1, false).expect("downgrade");
        assert_eq!(optimistic.len(), 12);
        assert!((optimistic[0] - (0.0 + 2.0 + 3.0) / 3.0).abs() < 1.0e-12);
        assert_eq!(optimistic[1], UNSEEN);
        assert!((optimistic[2] - 9.5).abs() < 1.0e-12);

        let pessimistic = ud_grade(&map, 1, true).expect("downgrade");
        assert_eq!(pessimistic[0], UNSEEN);
        assert!((pessimistic[2] - 9.5).abs() < 1.0e-12);
    }

    #[test]
    fn ud_grade_upgrade_replicates_values() {
        let map: Vec<f64> = (0..12).map(|value| value as f64).collect();
        let upgraded = ud_grade(&map, 2, false).expect("upgrade");
        assert_eq!(upgraded.len(), 48);
        assert_eq!(&upgraded[4..8], &[1.0; 4]);
        assert_eq!(ud_grade(&upgraded, 1, false).expect("downgrade"), map);
    }

    #[test]
    fn ring_and_nested_indices_are_inverse_permutations() {
        for nside in [1, 2, 4, 8] {
            let npix = nside2npix(nside).expect("npix");
            let mut seen = vec![false; npix];
            for pixel in 0..npix {
                let ring = nest2ring(nside, pixel).expect("ring index");
                assert!(!seen[ring], "nside {nside}: ring pixel {ring} hit twice");
                seen[ring] = true;
                assert_eq!(ring2nest(nside, ring).expect("nested index"), pixel);
            }
        }
        assert_eq!(nest2ring(2, 0).expect("ring index"), 13);
        assert_eq!(nest2ring(2, 3).expect("ring index"), 0);
        assert_eq!(ring2nest(1, 7).expect("nested index"), 7);
        assert_eq!(
            ring2nest(2, 48).expect_err("out of range"),
            HealpixError::PixelOutOfRange { pixel: 48, nside: 2 }
        );
    }

    #[test]
    fn ring_order_runs_from_north_to_south() {
        let nside = 4;
        let npix = nside2npix(nside).expect("npix");
        let colatitudes: Vec<f64> = (0..npix)
            .map(|ring| {
                let pixel = ring2nest(nside, ring).expect("nested index");
                pix2ang_nest(nside, pixel).expect("angle").0
            })
            .collect();
        for pair in colatitudes.windows(2) {
            assert!(pair[1] >= pair[0] - 1.0e-12);
        }
    }

    #[test]
    fn reorder_moves_values_with_their_pixels() {
        let nested: Vec<f64> = (0..48).map(|pixel| pixel as f64).collect();
        let ring = reorder(&nested, PixelOrdering::Nested, PixelOrdering::Ring).expect("ring");
        assert_eq!(ring[13], 0.0);
        assert_eq!(ring[0], 3.0);
        let back = reorder(&ring, PixelOrdering::Ring, PixelOrdering::Nested).expect("nested");
        assert_eq!(back, nested);
        assert!(reorder(&[1.0; 13], PixelOrdering::Ring, PixelOrdering::Nested).is_err());
    }
}
