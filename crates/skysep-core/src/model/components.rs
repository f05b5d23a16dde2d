//! Reference parametric emission laws.
//!
//! Scalings are relative to a reference frequency in GHz and dimensionless;
//! a component's free parameters come first-to-last in `free_parameters()`.

use crate::common::constants::H_OVER_K_GHZ;

/// A component parameter is either fitted (with a starting value) or pinned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parameter {
    Free(f64),
    Fixed(f64),
}

impl Parameter {
    pub fn is_free(self) -> bool {
        matches!(self, Self::Free(_))
    }

    pub fn value(self) -> f64 {
        match self {
            Self::Free(value) | Self::Fixed(value) => value,
        }
    }
}

pub trait Component {
    fn name(&self) -> &str;

    /// Names and starting values of the free parameters, in order.
    fn free_parameters(&self) -> Vec<(&'static str, f64)>;

    /// Scaling at `frequency` given the free parameter values.
    fn evaluate(&self, frequency: f64, params: &[f64]) -> f64;

    /// Derivative of the scaling with respect to each free parameter.
    fn gradient(&self, frequency: f64, params: &[f64]) -> Vec<f64>;

    fn n_free(&self) -> usize {
        self.free_parameters().len()
    }
}

/// Blackbody fluctuations in thermodynamic units: flat in frequency.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cmb;

impl Component for Cmb {
    fn name(&self) -> &str {
        "CMB"
    }

    fn free_parameters(&self) -> Vec<(&'static str, f64)> {
        Vec::new()
    }

    fn evaluate(&self, _frequency: f64, _params: &[f64]) -> f64 {
        1.0
    }

    fn gradient(&self, _frequency: f64, _params: &[f64]) -> Vec<f64> {
        Vec::new()
    }
}

/// `(nu / nu0) ^ beta`, e.g. synchrotron.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLaw {
    pub nu0: f64,
    pub beta: Parameter,
}

impl PowerLaw {
    pub fn new(nu0: f64, beta: f64) -> Self {
        Self {
            nu0,
            beta: Parameter::Free(beta),
        }
    }

    pub fn fixed(nu0: f64, beta: f64) -> Self {
        Self {
            nu0,
            beta: Parameter::Fixed(beta),
        }
    }

    fn beta(&self, params: &[f64]) -> f64 {
        if self.beta.is_free() {
            params[0]
        } else {
            self.beta.value()
        }
    }
}

impl Component for PowerLaw {
    fn name(&self) -> &str {
        "PowerLaw"
    }

    fn free_parameters(&self) -> Vec<(&'static str, f64)> {
        match self.beta {
            Parameter::Free(value) => vec![("beta_pl", value)],
            Parameter::Fixed(_) => Vec::new(),
        }
    }

    fn evaluate(&self, frequency: f64, params: &[f64]) -> f64 {
        (frequency / self.nu0).powf(self.beta(params))
    }

    fn gradient(&self, frequency: f64, params: &[f64]) -> Vec<f64> {
        if !self.beta.is_free() {
            return Vec::new();
        }
        let ratio = frequency / self.nu0;
        vec![ratio.powf(params[0]) * ratio.ln()]
    }
}

/// Modified black body in Rayleigh-Jeans units, e.g. thermal dust:
/// `(nu / nu0)^(beta + 1) * (exp(x0) - 1) / (exp(x) - 1)` with `x = h nu / k T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModifiedBlackBody {
    pub nu0: f64,
    pub beta: Parameter,
    pub temperature: Parameter,
}

impl ModifiedBlackBody {
    pub fn new(nu0: f64, beta: f64, temperature: f64) -> Self {
        Self {
            nu0,
            beta: Parameter::Free(beta),
            temperature: Parameter::Free(temperature),
        }
    }

    pub fn with_fixed_temperature(nu0: f64, beta: f64, temperature: f64) -> Self {
        Self {
            nu0,
            beta: Parameter::Free(beta),
            temperature: Parameter::Fixed(temperature),
        }
    }

    fn resolve(&self, params: &[f64]) -> (f64, f64) {
        let mut free = params.iter().copied();
        let beta = match self.beta {
            Parameter::Free(_) => free.next().unwrap_or(f64::NAN),
            Parameter::Fixed(value) => value,
        };
        let temperature = match self.temperature {
            Parameter::Free(_) => free.next().unwrap_or(f64::NAN),
            Parameter::Fixed(value) => value,
        };
        (beta, temperature)
    }
}

impl Component for ModifiedBlackBody {
    fn name(&self) -> &str {
        "ModifiedBlackBody"
    }

    fn free_parameters(&self) -> Vec<(&'static str, f64)> {
        let mut parameters = Vec::new();
        if let Parameter::Free(value) = self.beta {
            parameters.push(("beta_d", value));
        }
        if let Parameter::Free(value) = self.temperature {
            parameters.push(("temp", value));
        }
        parameters
    }

    fn evaluate(&self, frequency: f64, params: &[f64]) -> f64 {
        let (beta, temperature) = self.resolve(params);
        let x = H_OVER_K_GHZ * frequency / temperature;
        let x0 = H_OVER_K_GHZ * self.nu0 / temperature;
        (frequency / self.nu0).powf(beta + 1.0) * x0.exp_m1() / x.exp_m1()
    }

    fn gradient(&self, frequency: f64, params: &[f64]) -> Vec<f64> {
        let (_, temperature) = self.resolve(params);
        let value = self.evaluate(frequency, params);
        let mut gradient = Vec::new();
        if self.beta.is_free() {
            gradient.push(value * (frequency / self.nu0).ln());
        }
        if self.temperature.is_free() {
            let x = H_OVER_K_GHZ * frequency / temperature;
            let x0 = H_OVER_K_GHZ * self.nu0 / temperature;
            let log_derivative =
                (x * x.exp() / x.exp_m1() - x0 * x0.exp() / x0.exp_m1()) / temperature;
            gradient.push(value * log_derivative);
        }
        gradient
    }
}
