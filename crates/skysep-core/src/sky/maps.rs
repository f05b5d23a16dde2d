//! Stacked sky maps indexed as (channel, stokes, pixel).
//!
//! The leading axis holds frequencies on input and components on output.
//! Invalid entries are either the `UNSEEN` marker or explicitly flagged
//! through an optional per-element validity vector. Pixels are numbered in
//! RING order unless the stack says otherwise.

use super::healpix::{PixelOrdering, reorder};
use crate::common::constants::{UNSEEN, is_unseen};
use crate::domain::{SepResult, SeparationError};

#[derive(Debug, Clone, PartialEq)]
pub struct MapStack {
    channels: usize,
    stokes: usize,
    n_pix: usize,
    values: Vec<f64>,
    validity: Option<Vec<bool>>,
    ordering: PixelOrdering,
}

impl MapStack {
    pub fn new(channels: usize, stokes: usize, n_pix: usize, values: Vec<f64>) -> SepResult<Self> {
        if channels == 0 || stokes == 0 || n_pix == 0 {
            return Err(SeparationError::configuration(
                "CONFIG.MAP_SHAPE",
                format!("map stack axes must be non-empty, got ({channels}, {stokes}, {n_pix})"),
            ));
        }
        if values.len() != channels * stokes * n_pix {
            return Err(SeparationError::configuration(
                "CONFIG.MAP_SHAPE",
                format!(
                    "map stack ({channels}, {stokes}, {n_pix}) needs {} values, got {}",
                    channels * stokes * n_pix,
                    values.len()
                ),
            ));
        }
        Ok(Self {
            channels,
            stokes,
            n_pix,
            values,
            validity: None,
            ordering: PixelOrdering::default(),
        })
    }

    /// One map per channel, without a Stokes axis.
    pub fn from_channels(maps: &[Vec<f64>]) -> SepResult<Self> {
        let n_pix = maps.first().map_or(0, Vec::len);
        if maps.iter().any(|map| map.len() != n_pix) {
            return Err(SeparationError::configuration(
                "CONFIG.MAP_SHAPE",
                "all channel maps must share the same pixel count",
            ));
        }
        Self::new(maps.len(), 1, n_pix, maps.concat())
    }

    pub fn filled(channels: usize, stokes: usize, n_pix: usize, value: f64) -> SepResult<Self> {
        Self::new(channels, stokes, n_pix, vec![value; channels * stokes * n_pix])
    }

    /// Attach explicit per-element validity flags (`true` = usable).
    pub fn with_validity(mut self, validity: Vec<bool>) -> SepResult<Self> {
        if validity.len() != self.values.len() {
            return Err(SeparationError::configuration(
                "CONFIG.MAP_SHAPE",
                format!(
                    "validity flags need {} entries, got {}",
                    self.values.len(),
                    validity.len()
                ),
            ));
        }
        self.validity = Some(validity);
        Ok(self)
    }

    /// Declare the pixel numbering of the values without moving them.
    pub fn with_ordering(mut self, ordering: PixelOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn ordering(&self) -> PixelOrdering {
        self.ordering
    }

    /// The same sky numbered in `ordering`. Single-pixel stacks only change
    /// their label.
    pub fn reordered(&self, ordering: PixelOrdering) -> SepResult<Self> {
        let mut copy = self.clone().with_ordering(ordering);
        if ordering == self.ordering || self.n_pix == 1 {
            return Ok(copy);
        }
        for channel in 0..self.channels {
            for stokes in 0..self.stokes {
                let moved = reorder(self.map(channel, stokes), self.ordering, ordering)?;
                copy.map_mut(channel, stokes).copy_from_slice(&moved);
            }
        }
        if let Some(validity) = &self.validity {
            let mut flags = Vec::with_capacity(validity.len());
            for map in validity.chunks(self.n_pix) {
                flags.extend(reorder(map, self.ordering, ordering)?);
            }
            copy.validity = Some(flags);
        }
        Ok(copy)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn stokes(&self) -> usize {
        self.stokes
    }

    pub fn n_pix(&self) -> usize {
        self.n_pix
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn validity(&self) -> Option<&[bool]> {
        self.validity.as_deref()
    }

    pub fn index(&self, channel: usize, stokes: usize, pixel: usize) -> usize {
        (channel * self.stokes + stokes) * self.n_pix + pixel
    }

    pub fn get(&self, channel: usize, stokes: usize, pixel: usize) -> f64 {
        self.values[self.index(channel, stokes, pixel)]
    }

    pub fn set(&mut self, channel: usize, stokes: usize, pixel: usize, value: f64) {
        let index = self.index(channel, stokes, pixel);
        self.values[index] = value;
    }

    /// Value with length-1 Stokes and pixel axes broadcast.
    pub fn get_broadcast(&self, channel: usize, stokes: usize, pixel: usize) -> f64 {
        let stokes = if self.stokes == 1 { 0 } else { stokes };
        let pixel = if self.n_pix == 1 { 0 } else { pixel };
        self.get(channel, stokes, pixel)
    }

    pub fn is_element_valid(&self, index: usize) -> bool {
        let flagged = self
            .validity
            .as_ref()
            .is_some_and(|validity| !validity[index]);
        !flagged && !is_unseen(self.values[index])
    }

    pub fn map(&self, channel: usize, stokes: usize) -> &[f64] {
        let start = self.index(channel, stokes, 0);
        &self.values[start..start + self.n_pix]
    }

    pub fn map_mut(&mut self, channel: usize, stokes: usize) -> &mut [f64] {
        let start = self.index(channel, stokes, 0);
        &mut self.values[start..start + self.n_pix]
    }

    /// Plain values with invalid entries replaced by `UNSEEN`.
    pub fn to_sentinel_values(&self) -> Vec<f64> {
        (0..self.values.len())
            .map(|index| {
                if self.is_element_valid(index) {
                    self.values[index]
                } else {
                    UNSEEN
                }
            })
            .collect()
    }

    /// Copy with every channel and Stokes entry of `pixels` set to `value`.
    pub fn with_pixels_set(&self, pixels: impl Fn(usize) -> bool, value: f64) -> Self {
        let mut copy = self.clone();
        for channel in 0..self.channels {
            for stokes in 0..self.stokes {
                for (pixel, entry) in copy.map_mut(channel, stokes).iter_mut().enumerate() {
                    if pixels(pixel) {
                        *entry = value;
                    }
                }
            }
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::MapStack;
    use crate::common::constants::UNSEEN;
    use crate::sky::healpix::PixelOrdering;

    #[test]
    fn indexing_is_channel_major() {
        let stack = MapStack::new(2, 3, 4, (0..24).map(|value| value as f64).collect())
            .expect("stack");
        assert_eq!(stack.get(1, 2, 3), 23.0);
        assert_eq!(stack.get(0, 1, 0), 4.0);
        assert_eq!(stack.map(1, 0), &[12.0, 13.0, 14.0, 15.0]);
    }

    #[test]
    fn shape_mismatch_is_configuration_error() {
        let error = MapStack::new(2, 1, 4, vec![0.0; 7]).expect_err("wrong length");
        assert!(error.is_configuration());
        assert_eq!(error.code(), "CONFIG.MAP_SHAPE");
    }

    #[test]
    fn broadcast_collapses_unit_axes() {
        let stack = MapStack::new(2, 1, 1, vec![3.0, 5.0]).expect("stack");
        assert_eq!(stack.get_broadcast(1, 2, 40), 5.0);
    }

    #[test]
    fn validity_combines_flags_and_sentinel() {
        let stack = MapStack::new(1, 1, 3, vec![1.0, UNSEEN, 2.0])
            .expect("stack")
            .with_validity(vec![true, true, false])
            .expect("flags");
        assert!(stack.is_element_valid(0));
        assert!(!stack.is_element_valid(1));
        assert!(!stack.is_element_valid(2));
        assert_eq!(stack.to_sentinel_values(), vec![1.0, UNSEEN, UNSEEN]);
    }

    #[test]
    fn reordering_moves_values_and_flags_together() {
        let nested: Vec<f64> = (0..48).map(|pixel| pixel as f64).collect();
        let mut flags = vec![true; 48];
        flags[0] = false;
        let stack = MapStack::new(1, 1, 48, nested)
            .expect("stack")
            .with_ordering(PixelOrdering::Nested)
            .with_validity(flags)
            .expect("flags");
        let default = MapStack::filled(1, 1, 12, 0.0).expect("stack");
        assert_eq!(default.ordering(), PixelOrdering::Ring);

        let ring = stack.reordered(PixelOrdering::Ring).expect("ring");
        assert_eq!(ring.ordering(), PixelOrdering::Ring);
        assert_eq!(ring.get(0, 0, 0), 3.0);
        assert!(!ring.is_element_valid(13));
        assert_eq!(ring.reordered(PixelOrdering::Nested).expect("nested"), stack);

        let single = MapStack::filled(2, 1, 1, 1.0).expect("stack");
        assert_eq!(single.reordered(PixelOrdering::Nested).expect("label").values(), &[1.0, 1.0]);
    }
}
