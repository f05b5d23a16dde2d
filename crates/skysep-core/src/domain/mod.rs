pub mod errors;

pub use errors::{SepResult, SeparationError, SeparationErrorCategory};

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeparationRecipe {
    Basic,
    Weighted,
    MultiResolution,
    Ilc,
    HarmonicIlc,
}

impl SeparationRecipe {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "BASIC",
            Self::Weighted => "WEIGHTED",
            Self::MultiResolution => "MULTI_RES",
            Self::Ilc => "ILC",
            Self::HarmonicIlc => "HARMONIC_ILC",
        }
    }
}

impl Display for SeparationRecipe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}
