use crate::{MlErr, Result};

/// A named trainable tensor and its gradient accumulator, stored flat in row major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    value: Vec<f32>,
    grad: Vec<f32>,
}

impl Parameter {
    /// Creates a new `Parameter` with a zeroed gradient.
    ///
    /// # Arguments
    /// * `name` - A name unique within the model.
    /// * `shape` - The tensor shape.
    /// * `value` - The flat values.
    ///
    /// # Returns
    /// The parameter or a `SizeMismatch` if `value` doesn't fill `shape`.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, value: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().product();
        if value.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "parameter values",
                got: value.len(),
                expected,
            });
        }

        Ok(Self {
            name: name.into(),
            grad: vec![0.0; value.len()],
            shape,
            value,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn value(&self) -> &[f32] {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Splits the parameter into its values and gradient for an in place update.
    pub fn value_and_grad(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.value, &self.grad)
    }

    #[inline]
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// The L2 norm of the values.
    pub fn norm(&self) -> f32 {
        l2_norm(&self.value)
    }

    /// Overwrites the values with the ones of `other`.
    ///
    /// # Returns
    /// A `SizeMismatch` if the shapes differ.
    pub fn copy_from(&mut self, other: &Parameter) -> Result<()> {
        if self.shape != other.shape {
            return Err(MlErr::SizeMismatch {
                what: "parameter shape",
                got: other.len(),
                expected: self.len(),
            });
        }

        self.value.copy_from_slice(&other.value);
        Ok(())
    }
}

/// The L2 norm of a flat buffer.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
