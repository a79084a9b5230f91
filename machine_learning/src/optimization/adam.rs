use std::collections::BTreeMap;

use super::{Optimizer, OptimizerState};
use crate::{MlErr, Result, model::Parameter};

const KIND: &str = "adam";

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    steps: u64,
    v: Vec<f32>,
    s: Vec<f32>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// The moment buffers are sized on the first `step`, after the parameters they track.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            steps: 0,
            v: Vec::new(),
            s: Vec::new(),
        }
    }

    /// An `Adam` with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        let total: usize = params.iter().map(Parameter::len).sum();

        if self.v.is_empty() {
            self.v = vec![0.; total];
            self.s = vec![0.; total];
        } else if self.v.len() != total {
            return Err(MlErr::SizeMismatch {
                what: "adam moments",
                got: total,
                expected: self.v.len(),
            });
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.steps += 1;
        let t = self.steps.min(i32::MAX as u64) as i32;
        let bc1 = 1. - b1.powi(t);
        let bc2 = 1. - b2.powi(t);
        let step_size = lr * (bc2.sqrt() / bc1);

        let mut offset = 0;
        for param in params {
            let len = param.len();
            let v = &mut self.v[offset..offset + len];
            let s = &mut self.s[offset..offset + len];
            offset += len;

            let (value, grad) = param.value_and_grad();
            value
                .iter_mut()
                .zip(grad)
                .zip(v.iter_mut())
                .zip(s.iter_mut())
                .for_each(|(((p, g), v), s)| {
                    *v = b1 * *v + (1. - b1) * g;
                    *s = b2 * *s + (1. - b2) * g.powi(2);
                    *p -= step_size * *v / (s.sqrt() + eps);
                });
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut buffers = BTreeMap::new();
        buffers.insert("v".to_string(), self.v.clone());
        buffers.insert("s".to_string(), self.s.clone());
        buffers.insert(
            "hyper".to_string(),
            vec![self.beta1, self.beta2, self.epsilon],
        );

        OptimizerState {
            kind: KIND.to_string(),
            learning_rate: self.learning_rate,
            steps: self.steps,
            buffers,
        }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != KIND {
            return Err(MlErr::Unsupported("optimizer state of a different kind"));
        }

        let v = state.buffers.get("v").cloned().unwrap_or_default();
        let s = state.buffers.get("s").cloned().unwrap_or_default();
        if v.len() != s.len() {
            return Err(MlErr::SizeMismatch {
                what: "adam moments",
                got: s.len(),
                expected: v.len(),
            });
        }

        if let Some(&[b1, b2, eps]) = state.buffers.get("hyper").map(Vec::as_slice) {
            self.beta1 = b1;
            self.beta2 = b2;
            self.epsilon = eps;
        }

        self.learning_rate = state.learning_rate;
        self.steps = state.steps;
        self.v = v;
        self.s = s;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> Parameter {
        let mut p = Parameter::new("w", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        p.grad_mut().copy_from_slice(&[1.0, -1.0, 0.0]);
        p
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut p = param();
        let mut opt = Adam::with_learning_rate(0.1);
        opt.step(std::slice::from_mut(&mut p)).unwrap();

        assert!((p.value()[0] - 0.9).abs() < 1e-5);
        assert!((p.value()[1] - 2.1).abs() < 1e-5);
        assert_eq!(p.value()[2], 3.0);
    }

    #[test]
    fn restored_state_continues_identically() {
        let mut a = param();
        let mut b = param();
        let mut opt_a = Adam::with_learning_rate(0.05);
        opt_a.step(std::slice::from_mut(&mut a)).unwrap();

        let mut opt_b = Adam::with_learning_rate(1.0);
        opt_b.load_state(&opt_a.state()).unwrap();
        b.copy_from(&a).unwrap();

        opt_a.step(std::slice::from_mut(&mut a)).unwrap();
        opt_b.step(std::slice::from_mut(&mut b)).unwrap();
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn rejects_foreign_state() {
        let mut opt = Adam::with_learning_rate(0.1);
        let state = OptimizerState {
            kind: "gradient_descent".into(),
            ..Default::default()
        };
        assert!(opt.load_state(&state).is_err());
    }
}
