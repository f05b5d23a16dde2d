pub mod algebra;
pub mod dispatch;
pub mod harmonic;
pub mod ilc;
pub mod mask;
pub mod mixing;
pub mod patches;
pub mod recipes;
pub mod resolution;
pub mod solver;

pub use dispatch::{DispatchedFit, PatchFit, craft_maps, dispatch_fit};
pub use harmonic::{HarmonicIlcResult, harmonic_ilc};
pub use ilc::{IlcResult, PatchIds, ilc};
pub use mask::ValidityMask;
pub use mixing::{MixingEvaluator, ParameterDerivative, PatchedMixing, Prewhitening};
pub use patches::PatchLayout;
pub use recipes::{
    FitResult, ParameterCovariance, basic_comp_sep, multi_res_comp_sep, weighted_comp_sep,
};
pub use solver::{ComponentSolver, FitOutcome, FitProblem, LevenbergMarquardtSolver};
