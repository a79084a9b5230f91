use std::collections::BTreeMap;

use super::{Optimizer, OptimizerState};
use crate::{MlErr, Result, model::Parameter};

const KIND: &str = "gradient_descent";

/// Gradient descent optimization algorithm.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: f32,
    steps: u64,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `step`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            steps: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Makes a step in the opposite direction of the gradient, with a length of `learning_rate`.
    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        let lr = self.learning_rate;

        for param in params {
            let (value, grad) = param.value_and_grad();
            for (w, g) in value.iter_mut().zip(grad) {
                *w -= lr * g;
            }
        }

        self.steps += 1;
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: KIND.to_string(),
            learning_rate: self.learning_rate,
            steps: self.steps,
            buffers: BTreeMap::new(),
        }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != KIND {
            return Err(MlErr::Unsupported("optimizer state of a different kind"));
        }

        self.learning_rate = state.learning_rate;
        self.steps = state.steps;
        Ok(())
    }
}
