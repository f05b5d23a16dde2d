//! Serde-backed options for the nonlinear fit.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Stop once the step norm falls below this fraction of the parameter norm.
    pub parameter_tolerance: f64,
    /// Stop once the relative cost decrease falls below this value.
    pub cost_tolerance: f64,
    pub initial_damping: f64,
    pub damping_increase: f64,
    pub damping_decrease: f64,
    pub max_damping: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            parameter_tolerance: 1.0e-9,
            cost_tolerance: 1.0e-14,
            initial_damping: 1.0e-3,
            damping_increase: 10.0,
            damping_decrease: 0.1,
            max_damping: 1.0e12,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read solver options '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse solver options: {source}")]
    Parse { source: serde_json::Error },
    #[error("solver option '{name}' must be finite and positive, got {value}")]
    InvalidValue { name: &'static str, value: f64 },
}

impl SolverOptions {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let options: Self =
            serde_json::from_str(source).map_err(|source| ConfigError::Parse { source })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("parameterTolerance", self.parameter_tolerance),
            ("costTolerance", self.cost_tolerance),
            ("initialDamping", self.initial_damping),
            ("dampingIncrease", self.damping_increase),
            ("dampingDecrease", self.damping_decrease),
            ("maxDamping", self.max_damping),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidValue { name, value });
            }
        }
        Ok(())
    }
}

pub fn load_solver_options(path: impl AsRef<Path>) -> Result<SolverOptions, ConfigError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    SolverOptions::from_json_str(&source)
}
