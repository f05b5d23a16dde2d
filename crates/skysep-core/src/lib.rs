//! Parametric and ILC component separation of multi-frequency HEALPix maps.

pub mod common;
pub mod domain;
pub mod model;
pub mod numerics;
pub mod separation;
pub mod sky;

pub use common::{Instrument, InstrumentRecord, SolverOptions, UNSEEN};
pub use domain::{SepResult, SeparationError, SeparationErrorCategory, SeparationRecipe};
pub use model::{Cmb, Component, MixingMatrix, ModifiedBlackBody, PowerLaw};
pub use separation::{
    FitResult, HarmonicIlcResult, IlcResult, LevenbergMarquardtSolver, PatchIds,
    basic_comp_sep, harmonic_ilc, ilc, multi_res_comp_sep, weighted_comp_sep,
};
pub use sky::{MapStack, PixelOrdering};
