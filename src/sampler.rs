//! Monte Carlo sampling over a stochastic model.

use crate::config::{ConfigError, OodConfig};
use crate::model::{ImageTensor, InferenceError, StochasticModel};
use std::num::NonZeroUsize;

/// The outputs of S stochastic passes over one input. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct McBatch<T> {
    outputs: Vec<T>,
}

impl<T> McBatch<T> {
    /// Wrap collected outputs; `None` if there are none
    #[must_use]
    pub fn from_outputs(outputs: Vec<T>) -> Option<Self> {
        if outputs.is_empty() {
            None
        } else {
            Some(Self { outputs })
        }
    }

    /// Number of stochastic samples (S)
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Always false; kept for API symmetry with `len`
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.outputs.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.outputs
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<T> {
        self.outputs
    }
}

impl<'a, T> IntoIterator for &'a McBatch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.outputs.iter()
    }
}

/// Runs a fixed number of stochastic forward passes per input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StochasticSampler {
    samples: NonZeroUsize,
}

impl StochasticSampler {
    #[must_use]
    pub const fn new(samples: NonZeroUsize) -> Self {
        Self { samples }
    }

    /// Sampler with `mc_samples` passes
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `mc_samples` is zero.
    pub fn from_config(config: &OodConfig) -> Result<Self, ConfigError> {
        NonZeroUsize::new(config.mc_samples)
            .map(Self::new)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "mc_samples",
                reason: "must be greater than zero".to_string(),
            })
    }

    /// Number of passes per input
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples.get()
    }

    /// Run S forward passes with stochastic mode forced on.
    ///
    /// The model's previous mode is restored afterwards. The first failing
    /// pass aborts the batch and its error is returned unchanged.
    ///
    /// # Errors
    ///
    /// Propagates any per-pass inference failure.
    pub fn draw<M>(
        &self,
        model: &mut M,
        input: &ImageTensor,
    ) -> Result<McBatch<M::Output>, InferenceError>
    where
        M: StochasticModel + ?Sized,
    {
        let previous = model.is_stochastic();
        model.set_stochastic_mode(true);
        let outputs = (0..self.samples.get())
            .map(|_| model.forward(input))
            .collect::<Result<Vec<_>, _>>();
        model.set_stochastic_mode(previous);

        let outputs = outputs?;
        McBatch::from_outputs(outputs)
            .ok_or_else(|| InferenceError::InferenceFailed("no samples drawn".to_string()))
    }
}

impl Default for StochasticSampler {
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN.saturating_add(29))
    }
}
