pub mod config;
pub mod constants;
pub mod instrument;

pub use config::{ConfigError, SolverOptions, load_solver_options};
pub use constants::{UNSEEN, is_unseen};
pub use instrument::{Instrument, InstrumentError, InstrumentMapping, InstrumentRecord};

use crate::domain::SeparationError;

impl From<InstrumentError> for SeparationError {
    fn from(error: InstrumentError) -> Self {
        let code = match error {
            InstrumentError::MissingAttribute { .. } => "CONFIG.INSTRUMENT_MISSING_ATTRIBUTE",
            InstrumentError::InvalidAttribute { .. } => "CONFIG.INSTRUMENT_INVALID_ATTRIBUTE",
            InstrumentError::NotAMapping { .. } | InstrumentError::Parse { .. } => {
                "CONFIG.INSTRUMENT_PARSE"
            }
            InstrumentError::Read { .. } => "CONFIG.INSTRUMENT_READ",
        };
        SeparationError::configuration(code, error.to_string())
    }
}

impl From<ConfigError> for SeparationError {
    fn from(error: ConfigError) -> Self {
        SeparationError::configuration("CONFIG.SOLVER_OPTIONS", error.to_string())
    }
}
