//! Mapping between the flat parameter vector seen by the solver and
//! per-parameter sky maps.
//!
//! The fit works on "cells": pixels of a working resolution that share one
//! mixing matrix. Each free parameter partitions the cells into patches; the
//! flat vector stores one value per (parameter, patch), parameter-major.

use super::resolution;
use crate::common::constants::UNSEEN;
use crate::domain::{SepResult, SeparationError};

#[derive(Debug, Clone, PartialEq)]
struct ParameterPatches {
    offset: usize,
    n_patches: usize,
    default: f64,
    /// Patch of every cell, `None` when the cell is not covered.
    patch_of_cell: Vec<Option<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Reporting {
    Global,
    Resolutions(Vec<u32>),
    Clusters(Vec<Vec<Vec<usize>>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchLayout {
    n_cells: usize,
    parameters: Vec<ParameterPatches>,
    reporting: Reporting,
}

impl PatchLayout {
    /// One value per parameter shared by a single cell.
    pub fn global(defaults: &[f64]) -> Self {
        let parameters = defaults
            .iter()
            .enumerate()
            .map(|(index, &default)| ParameterPatches {
                offset: index,
                n_patches: 1,
                default,
                patch_of_cell: vec![Some(0)],
            })
            .collect();
        Self {
            n_cells: 1,
            parameters,
            reporting: Reporting::Global,
        }
    }

    /// Parameter `i` is constant over the pixels of `nsides[i]`; cells are the
    /// pixels of the largest of them.
    pub fn resolutions(nsides: &[u32], defaults: &[f64]) -> SepResult<Self> {
        check_parameter_count(nsides.len(), defaults.len(), "nsides")?;
        let working_nside = nsides.iter().copied().max().unwrap_or(0);
        let n_cells = resolution::npix(working_nside)?;

        let mut offset = 0;
        let mut parameters = Vec::with_capacity(nsides.len());
        for (&nside, &default) in nsides.iter().zip(defaults) {
            let n_patches = resolution::npix(nside)?;
            let ids: Vec<f64> = (0..n_patches).map(|id| id as f64).collect();
            let patch_of_cell = resolution::regrade(&ids, working_nside)?
                .into_iter()
                .map(|id| Some(id as usize))
                .collect();
            parameters.push(ParameterPatches {
                offset,
                n_patches,
                default,
                patch_of_cell,
            });
            offset += n_patches;
        }

        Ok(Self {
            n_cells,
            parameters,
            reporting: Reporting::Resolutions(nsides.to_vec()),
        })
    }

    /// Parameter `i` takes one value per cluster in `clusters[i]`; cells are
    /// the `n_pix` data pixels. Uncovered pixels keep the parameter default.
    pub fn clusters(
        clusters: &[Vec<Vec<usize>>],
        n_pix: usize,
        defaults: &[f64],
        valid: &[bool],
    ) -> SepResult<Self> {
        check_parameter_count(clusters.len(), defaults.len(), "cluster lists")?;

        let mut offset = 0;
        let mut parameters = Vec::with_capacity(clusters.len());
        for (param, (param_clusters, &default)) in clusters.iter().zip(defaults).enumerate() {
            let mut patch_of_cell = vec![None; n_pix];
            for (patch, pixels) in param_clusters.iter().enumerate() {
                for &pixel in pixels {
                    let slot = patch_of_cell.get_mut(pixel).ok_or_else(|| {
                        SeparationError::configuration(
                            "CONFIG.PATCH_PARTITION",
                            format!("parameter {param}: pixel {pixel} outside a {n_pix}-pixel map"),
                        )
                    })?;
                    if slot.is_some() {
                        return Err(SeparationError::configuration(
                            "CONFIG.PATCH_PARTITION",
                            format!("parameter {param}: pixel {pixel} belongs to two clusters"),
                        ));
                    }
                    *slot = Some(patch);
                }
            }

            let uncovered = patch_of_cell
                .iter()
                .zip(valid)
                .filter(|&(patch, &is_valid)| patch.is_none() && is_valid)
                .count();
            if uncovered > 0 {
                tracing::warn!(
                    parameter = param,
                    uncovered,
                    "valid pixels outside every cluster keep the default parameter value"
                );
            }

            parameters.push(ParameterPatches {
                offset,
                n_patches: param_clusters.len(),
                default,
                patch_of_cell,
            });
            offset += param_clusters.len();
        }

        Ok(Self {
            n_cells: n_pix,
            parameters,
            reporting: Reporting::Clusters(clusters.to_vec()),
        })
    }

    pub fn n_params(&self) -> usize {
        self.parameters.len()
    }

    pub fn n_free(&self) -> usize {
        self.parameters.iter().map(|param| param.n_patches).sum()
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Parameter defaults repeated over every patch.
    pub fn initial_guess(&self) -> Vec<f64> {
        self.parameters
            .iter()
            .flat_map(|param| std::iter::repeat_n(param.default, param.n_patches))
            .collect()
    }

    /// Flat index of the value parameter `param` takes in `cell`.
    pub fn flat_index(&self, param: usize, cell: usize) -> Option<usize> {
        let patches = &self.parameters[param];
        patches.patch_of_cell[cell].map(|patch| patches.offset + patch)
    }

    /// Every parameter value in one cell.
    pub fn cell_params(&self, x: &[f64], cell: usize) -> Vec<f64> {
        (0..self.parameters.len())
            .map(|param| match self.flat_index(param, cell) {
                Some(index) => x[index],
                None => self.parameters[param].default,
            })
            .collect()
    }

    /// One map per parameter over the cells.
    pub fn unpack(&self, x: &[f64]) -> Vec<Vec<f64>> {
        (0..self.parameters.len())
            .map(|param| {
                (0..self.n_cells)
                    .map(|cell| match self.flat_index(param, cell) {
                        Some(index) => x[index],
                        None => self.parameters[param].default,
                    })
                    .collect()
            })
            .collect()
    }

    /// Parameter maps for reporting: each parameter at its own resolution,
    /// or painted at data resolution with `UNSEEN` outside the clusters.
    pub fn to_maps(&self, x: &[f64]) -> Vec<Vec<f64>> {
        self.parameters
            .iter()
            .enumerate()
            .map(|(param, patches)| {
                let values = &x[patches.offset..patches.offset + patches.n_patches];
                match &self.reporting {
                    Reporting::Global | Reporting::Resolutions(_) => values.to_vec(),
                    Reporting::Clusters(clusters) => {
                        let mut map = vec![UNSEEN; self.n_cells];
                        for (value, pixels) in values.iter().zip(&clusters[param]) {
                            for &pixel in pixels {
                                map[pixel] = *value;
                            }
                        }
                        map
                    }
                }
            })
            .collect()
    }

    /// Inverse of [`PatchLayout::to_maps`].
    #[cfg(test)]
    pub(crate) fn pack(&self, maps: &[Vec<f64>]) -> SepResult<Vec<f64>> {
        if maps.len() != self.parameters.len() {
            return Err(SeparationError::configuration(
                "CONFIG.PARAMETER_MAPS",
                format!(
                    "expected {} parameter maps, got {}",
                    self.parameters.len(),
                    maps.len()
                ),
            ));
        }
        let mut x = Vec::with_capacity(self.n_free());
        for (param, (patches, map)) in self.parameters.iter().zip(maps).enumerate() {
            match &self.reporting {
                Reporting::Global | Reporting::Resolutions(_) => {
                    if map.len() != patches.n_patches {
                        return Err(SeparationError::configuration(
                            "CONFIG.PARAMETER_MAPS",
                            format!(
                                "parameter {param} needs {} values, got {}",
                                patches.n_patches,
                                map.len()
                            ),
                        ));
                    }
                    x.extend_from_slice(map);
                }
                Reporting::Clusters(clusters) => {
                    for pixels in &clusters[param] {
                        x.push(pixels.first().map_or(patches.default, |&pixel| map[pixel]));
                    }
                }
            }
        }
        Ok(x)
    }

    /// Resolution at which `to_maps` reports each parameter.
    pub fn reporting_nsides(&self, data_nside: u32) -> Vec<u32> {
        match &self.reporting {
            Reporting::Global => vec![0; self.parameters.len()],
            Reporting::Resolutions(nsides) => nsides.clone(),
            Reporting::Clusters(_) => vec![data_nside; self.parameters.len()],
        }
    }
}

fn check_parameter_count(given: usize, expected: usize, what: &str) -> SepResult<()> {
    if given != expected {
        return Err(SeparationError::configuration(
            "CONFIG.PARAMETER_COUNT",
            format!("{expected} free parameters but {given} {what}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::PatchLayout;
    use crate::common::constants::UNSEEN;

    #[test]
    fn resolutions_split_runs_and_upgrade() {
        let layout = PatchLayout::resolutions(&[0, 1, 2], &[1.5, 20.0, -3.0]).expect("layout");
        assert_eq!(layout.n_free(), 1 + 12 + 48);
        assert_eq!(layout.n_cells(), 48);
        let x0 = layout.initial_guess();
        assert_eq!(x0[0], 1.5);
        assert!(x0[1..13].iter().all(|&value| value == 20.0));
        assert!(x0[13..].iter().all(|&value| value == -3.0));

        let x: Vec<f64> = (0..layout.n_free()).map(|value| value as f64).collect();
        let maps = layout.unpack(&x);
        assert!(maps[0].iter().all(|&value| value == 0.0));
        assert_eq!(maps[1][4..8], [2.0; 4]);
        assert_eq!(maps[2][5], 18.0);
        assert_eq!(layout.cell_params(&x, 9), vec![0.0, 3.0, 22.0]);
        assert_eq!(layout.flat_index(1, 47), Some(12));
    }

    #[test]
    fn report_maps_invert_packing() {
        let layout = PatchLayout::resolutions(&[1, 0], &[1.0, 2.0]).expect("layout");
        let x: Vec<f64> = (0..13).map(|value| value as f64 * 0.1).collect();
        let maps = layout.to_maps(&x);
        assert_eq!(maps[0].len(), 12);
        assert_eq!(maps[1].len(), 1);
        assert_eq!(layout.pack(&maps).expect("pack"), x);
    }

    #[test]
    fn clusters_paint_and_keep_defaults() {
        let clusters = vec![vec![vec![0, 1, 2], vec![5, 6]], vec![(0..12).collect()]];
        let valid = vec![true; 12];
        let layout = PatchLayout::clusters(&clusters, 12, &[1.5, 20.0], &valid).expect("layout");
        assert_eq!(layout.n_free(), 3);
        let x = vec![1.1, 1.2, 19.0];
        let maps = layout.unpack(&x);
        assert_eq!(maps[0][..3], [1.1; 3]);
        assert_eq!(maps[0][3], 1.5);
        assert_eq!(maps[0][6], 1.2);
        assert!(maps[1].iter().all(|&value| value == 19.0));

        let report = layout.to_maps(&x);
        assert_eq!(report[0][3], UNSEEN);
        assert_eq!(report[0][5], 1.2);
        assert_eq!(layout.pack(&report).expect("pack"), x);
    }

    #[test]
    fn overlapping_or_out_of_range_clusters_are_rejected() {
        let valid = vec![true; 12];
        let overlap = vec![vec![vec![0, 1], vec![1, 2]]];
        let error = PatchLayout::clusters(&overlap, 12, &[1.0], &valid).expect_err("overlap");
        assert_eq!(error.code(), "CONFIG.PATCH_PARTITION");

        let outside = vec![vec![vec![0, 12]]];
        assert!(PatchLayout::clusters(&outside, 12, &[1.0], &valid).is_err());

        let error = PatchLayout::resolutions(&[1], &[1.0, 2.0]).expect_err("count");
        assert_eq!(error.code(), "CONFIG.PARAMETER_COUNT");
    }
}
