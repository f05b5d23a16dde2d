//! Resolution conversions that also accept `nside == 0`, i.e. a single
//! sky-wide value stored as a one-element map.

use crate::common::constants::{UNSEEN, is_unseen};
use crate::domain::SepResult;
use crate::sky::healpix::{self, validate_nside};

/// Pixel count at `nside`, with `nside == 0` holding one value.
pub fn npix(nside: u32) -> SepResult<usize> {
    if nside == 0 {
        return Ok(1);
    }
    Ok(healpix::nside2npix(nside)?)
}

/// Resolution of a map from its length; a single value is `nside == 0`.
pub fn nside_of(map_len: usize) -> SepResult<u32> {
    if map_len == 1 {
        return Ok(0);
    }
    Ok(healpix::npix2nside(map_len)?)
}

/// Optimistic up/down grading between any two levels including 0.
///
/// Going to level 0 first downgrades to `nside == 1` and then takes the mean
/// of the base pixels that still carry data, so a base pixel with no data at
/// all does not drag the value towards zero.
pub fn regrade(map: &[f64], nside_out: u32) -> SepResult<Vec<f64>> {
    if nside_out != 0 {
        validate_nside(nside_out)?;
    }
    let nside_in = nside_of(map.len())?;

    if nside_out == 0 {
        if nside_in == 0 {
            return Ok(map.to_vec());
        }
        let base = healpix::ud_grade(map, 1, false)?;
        return Ok(vec![representative_value(&base)]);
    }

    if nside_in == 0 {
        return Ok(vec![map[0]; healpix::nside2npix(nside_out)?]);
    }
    Ok(healpix::ud_grade(map, nside_out, false)?)
}

fn representative_value(base: &[f64]) -> f64 {
    let (sum, count) = base
        .iter()
        .filter(|&&value| !is_unseen(value))
        .fold((0.0, 0usize), |(sum, count), &value| (sum + value, count + 1));
    if count == 0 { UNSEEN } else { sum / count as f64 }
}

/// Low-resolution pixels (at `nside_out`) whose children are all masked.
pub fn fully_masked(invalid: &[bool], nside_out: u32) -> SepResult<Vec<bool>> {
    let as_float: Vec<f64> = invalid
        .iter()
        .map(|&bad| if bad { 1.0 } else { 0.0 })
        .collect();
    Ok(regrade(&as_float, nside_out)?
        .into_iter()
        .map(|value| value == 1.0)
        .collect())
}
