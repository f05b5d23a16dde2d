pub mod healpix;
pub mod maps;
pub mod transform;

pub use healpix::{HealpixError, PixelOrdering, npix2nside, nside2npix, nside2resol, ud_grade};
pub use maps::MapStack;
pub use transform::{
    Alm, BeamWindow, DirectTransform, SphericalTransform, TransformError, gauss_beam,
};

use crate::domain::SeparationError;

impl From<HealpixError> for SeparationError {
    fn from(error: HealpixError) -> Self {
        SeparationError::configuration("CONFIG.RESOLUTION", error.to_string())
    }
}

impl From<TransformError> for SeparationError {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::Healpix(inner) => inner.into(),
            other => SeparationError::configuration("CONFIG.HARMONIC_TRANSFORM", other.to_string()),
        }
    }
}
