use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Result, model::Parameter};

/// A snapshot of an optimizer, enough to continue updating exactly where it left off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub learning_rate: f32,
    pub steps: u64,
    pub buffers: BTreeMap<String, Vec<f32>>,
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send {
    fn learning_rate(&self) -> f32;

    /// Changes the rate used by every following `step`.
    fn set_learning_rate(&mut self, learning_rate: f32);

    /// Updates every parameter using the gradient it accumulated.
    ///
    /// # Arguments
    /// * `params` - The parameters to update, always passed in the same order.
    ///
    /// # Returns
    /// An error if the parameters don't match the sizes seen on previous steps.
    fn step(&mut self, params: &mut [Parameter]) -> Result<()>;

    fn state(&self) -> OptimizerState;

    /// Restores a snapshot taken with `state`.
    ///
    /// # Returns
    /// An error if the snapshot belongs to a different kind of optimizer.
    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}
