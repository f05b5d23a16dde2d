use crate::domain::{SepResult, SeparationError};
use crate::sky::MapStack;
use crate::sky::healpix::{PixelOrdering, reorder};

/// Per-pixel validity (`true` = usable), fixed once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    valid: Vec<bool>,
}

impl ValidityMask {
    pub fn all_valid(n_pix: usize) -> Self {
        Self {
            valid: vec![true; n_pix],
        }
    }

    pub fn from_flags(valid: Vec<bool>) -> Self {
        Self { valid }
    }

    /// Collapse every leading axis of every stack onto the pixel axis: a
    /// pixel is invalid if any element at that pixel is invalid in any input.
    /// Stacks with a single pixel are broadcast over the whole map.
    pub fn unify(stacks: &[&MapStack]) -> SepResult<Self> {
        let n_pix = stacks
            .iter()
            .map(|stack| stack.n_pix())
            .max()
            .ok_or_else(|| {
                SeparationError::configuration("CONFIG.MAP_SHAPE", "no maps to build a mask from")
            })?;

        let mut valid = vec![true; n_pix];
        for stack in stacks {
            if stack.n_pix() != n_pix && stack.n_pix() != 1 {
                return Err(SeparationError::configuration(
                    "CONFIG.MAP_SHAPE",
                    format!(
                        "cannot broadcast {} pixels against {n_pix} pixels",
                        stack.n_pix()
                    ),
                ));
            }
            for channel in 0..stack.channels() {
                for stokes in 0..stack.stokes() {
                    for pixel in 0..stack.n_pix() {
                        if stack.is_element_valid(stack.index(channel, stokes, pixel)) {
                            continue;
                        }
                        if stack.n_pix() == 1 {
                            valid.fill(false);
                        } else {
                            valid[pixel] = false;
                        }
                    }
                }
            }
        }
        Ok(Self { valid })
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn is_valid(&self, pixel: usize) -> bool {
        self.valid[pixel]
    }

    pub fn flags(&self) -> &[bool] {
        &self.valid
    }

    pub fn valid_indices(&self) -> Vec<usize> {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(pixel, &valid)| valid.then_some(pixel))
            .collect()
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&valid| valid).count()
    }

    /// The same mask numbered in `to` instead of `from`.
    pub fn reordered(&self, from: PixelOrdering, to: PixelOrdering) -> SepResult<Self> {
        if self.valid.len() == 1 {
            return Ok(self.clone());
        }
        Ok(Self {
            valid: reorder(&self.valid, from, to)?,
        })
    }

    pub fn valid_fraction(&self) -> f64 {
        if self.valid.is_empty() {
            return 0.0;
        }
        self.n_valid() as f64 / self.valid.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::ValidityMask;
    use crate::common::constants::UNSEEN;
    use crate::sky::MapStack;

    #[test]
    fn any_channel_or_stokes_invalidates_pixel() {
        let mut data = MapStack::filled(3, 2, 4, 1.0).expect("data");
        data.set(2, 0, 1, UNSEEN);
        data.set(0, 1, 3, UNSEEN);
        let mask = ValidityMask::unify(&[&data]).expect("mask");
        assert_eq!(mask.flags(), &[true, false, true, false]);
        assert_eq!(mask.valid_indices(), vec![0, 2]);
        assert_eq!(mask.n_valid(), 2);
        assert!((mask.valid_fraction() - 0.5).abs() < 1.0e-15);
    }

    #[test]
    fn flags_and_covariance_contribute() {
        let data = MapStack::filled(2, 1, 3, 1.0)
            .expect("data")
            .with_validity(vec![true, true, true, true, false, true])
            .expect("flags");
        let mut covariance = MapStack::filled(2, 1, 3, 0.5).expect("covariance");
        covariance.set(0, 0, 0, UNSEEN);
        let mask = ValidityMask::unify(&[&data, &covariance]).expect("mask");
        assert_eq!(mask.flags(), &[false, false, true]);
    }

    #[test]
    fn single_pixel_covariance_broadcasts() {
        let data = MapStack::filled(2, 1, 4, 1.0).expect("data");
        let covariance = MapStack::filled(2, 1, 1, 0.5).expect("covariance");
        let mask = ValidityMask::unify(&[&data, &covariance]).expect("mask");
        assert_eq!(mask.n_valid(), 4);

        let mismatched = MapStack::filled(2, 1, 3, 0.5).expect("covariance");
        let error = ValidityMask::unify(&[&data, &mismatched]).expect_err("shape");
        assert!(error.is_configuration());
    }
}
