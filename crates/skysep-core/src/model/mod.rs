pub mod components;

pub use components::{Cmb, Component, ModifiedBlackBody, Parameter, PowerLaw};

use crate::numerics::DenseMatrix;

/// Ordered set of components forming the columns of the mixing matrix.
///
/// Free parameters are flattened component by component; each belongs to
/// exactly one component.
pub struct MixingMatrix {
    components: Vec<Box<dyn Component>>,
}

impl std::fmt::Debug for MixingMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixingMatrix")
            .field("components", &self.component_names())
            .field("params", &self.params())
            .finish()
    }
}

impl MixingMatrix {
    pub fn new(components: Vec<Box<dyn Component>>) -> Self {
        Self { components }
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| component.name().to_string())
            .collect()
    }

    pub fn n_param(&self) -> usize {
        self.components.iter().map(|component| component.n_free()).sum()
    }

    /// Parameter names as `Component.parameter`.
    pub fn params(&self) -> Vec<String> {
        self.components
            .iter()
            .flat_map(|component| {
                component
                    .free_parameters()
                    .into_iter()
                    .map(move |(name, _)| format!("{}.{name}", component.name()))
            })
            .collect()
    }

    pub fn defaults(&self) -> Vec<f64> {
        self.components
            .iter()
            .flat_map(|component| component.free_parameters().into_iter().map(|(_, value)| value))
            .collect()
    }

    /// Component (column) index affected by each free parameter.
    pub fn comp_of_param(&self) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .flat_map(|(index, component)| std::iter::repeat_n(index, component.n_free()))
            .collect()
    }

    /// `(n_freq, n_comp)` matrix at the given free parameters.
    pub fn eval(&self, frequencies: &[f64], params: &[f64]) -> DenseMatrix {
        let slices = self.param_slices(params);
        DenseMatrix::from_fn(frequencies.len(), self.components.len(), |row, col| {
            self.components[col].evaluate(frequencies[row], slices[col])
        })
    }

    /// One `(n_freq, n_comp)` derivative matrix per free parameter. Only the
    /// column of the owning component is non-zero.
    pub fn diff(&self, frequencies: &[f64], params: &[f64]) -> Vec<DenseMatrix> {
        let slices = self.param_slices(params);
        let owners = self.comp_of_param();
        let mut derivatives = Vec::with_capacity(owners.len());
        for (col, component) in self.components.iter().enumerate() {
            if component.n_free() == 0 {
                continue;
            }
            let per_frequency: Vec<Vec<f64>> = frequencies
                .iter()
                .map(|&frequency| component.gradient(frequency, slices[col]))
                .collect();
            for local in 0..component.n_free() {
                let mut matrix = DenseMatrix::zeros(frequencies.len(), self.components.len());
                for (row, gradient) in per_frequency.iter().enumerate() {
                    matrix[(row, col)] = gradient[local];
                }
                derivatives.push(matrix);
            }
        }
        derivatives
    }

    fn param_slices<'a>(&self, params: &'a [f64]) -> Vec<&'a [f64]> {
        let mut offset = 0;
        self.components
            .iter()
            .map(|component| {
                let end = (offset + component.n_free()).min(params.len());
                let slice = &params[offset.min(end)..end];
                offset += component.n_free();
                slice
            })
            .collect()
    }
}
