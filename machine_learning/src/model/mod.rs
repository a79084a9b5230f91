mod codebook;
mod linear;
mod parameter;

use std::collections::BTreeMap;

use ndarray::{Array2, Array3};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub use codebook::Codebook;
pub use linear::{LinearPredictor, LinearPredictorConfig};
pub use parameter::{Parameter, l2_norm};

use crate::{Batch, MlErr, Result};

/// Named scalar diagnostics reported by a model.
pub type Metrics = BTreeMap<String, f32>;

/// The kind of latent bottleneck a model routes its conditioning through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bottleneck {
    #[default]
    None,
    Ae,
    Vae,
    Vqvae,
    VqvaeEma,
}

impl Bottleneck {
    /// Whether the bottleneck owns a codebook that must be initialized before training.
    pub fn has_codebook(self) -> bool {
        matches!(self, Bottleneck::Vqvae | Bottleneck::VqvaeEma)
    }
}

/// The result of a forward pass over one batch.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Unnormalized class scores, `(B, Q, N)`.
    pub logits: Array3<f32>,
    /// Target class per prediction, `(B, N)`.
    pub target: Array2<usize>,
    /// The scalar objective.
    pub loss: f32,
}

/// A trainable model, as the coordinators see it.
///
/// The model owns its parameters and their gradient accumulators. `run` computes the objective
/// and keeps whatever `backward` needs to fill the gradients.
pub trait Model: Send {
    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Forward pass plus objective over `batch`.
    fn run(&mut self, batch: &Batch) -> Result<StepOutput>;

    /// Accumulates the gradient of the last `run` into the parameters.
    fn backward(&mut self) -> Result<()>;

    fn bottleneck(&self) -> Bottleneck {
        Bottleneck::None
    }

    /// The number of quantization classes of the output signal.
    fn n_quant(&self) -> usize {
        256
    }

    fn zero_grad(&mut self) {
        self.parameters_mut().iter_mut().for_each(Parameter::zero_grad);
    }

    /// Diagnostics of the objective from the last `run`.
    fn objective_metrics(&self) -> Metrics {
        Metrics::new()
    }

    /// Diagnostics of the encoder from the last `run`.
    fn encoder_metrics(&self) -> Metrics {
        Metrics::new()
    }

    fn set_anneal_weight(&mut self, _weight: f32) {}

    fn anneal_weight(&self) -> f32 {
        0.0
    }

    fn free_nats(&self) -> f32 {
        0.0
    }

    /// Seeds the codebook from warm-up batches.
    fn init_codebook(&mut self, _batches: &[Batch]) -> Result<()> {
        Ok(())
    }

    /// Re-initializes the codebook entries that went unused.
    fn update_codebook(&mut self, _rng: &mut dyn RngCore) {}

    /// State outside the parameters that must survive a checkpoint, such as a codebook.
    ///
    /// Buffers are never touched by the optimizer.
    fn buffers(&self) -> Vec<Parameter> {
        Vec::new()
    }

    /// Restores the state returned by `buffers`, matched by name.
    fn load_buffers(&mut self, _buffers: &[Parameter]) -> Result<()> {
        Ok(())
    }

    /// Sets how many sampled variants `infer` produces next to the reconstruction.
    fn set_n_replicas(&mut self, _n: usize) {}

    /// Produces `(B, n_replicas + 1, T)` quantized sequences: the reconstruction first, then the
    /// sampled variants.
    fn infer(&mut self, _batch: &Batch, _rng: &mut dyn RngCore) -> Result<Array3<usize>> {
        Err(MlErr::Unsupported("inference"))
    }

    /// Overwrites the parameter values with `params`, matched by name.
    ///
    /// # Returns
    /// An error if a parameter is missing or has a different shape.
    fn load_parameters(&mut self, params: &[Parameter]) -> Result<()> {
        for target in self.parameters_mut() {
            let source = params
                .iter()
                .find(|p| p.name() == target.name())
                .ok_or_else(|| MlErr::UnknownParameter {
                    name: target.name().to_string(),
                })?;

            target.copy_from(source)?;
        }

        Ok(())
    }
}
