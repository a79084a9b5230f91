mod direct;
mod replicated;

use machine_learning::{
    Device, RunPosition,
    model::Parameter,
    optimization::Optimizer,
    source::{BatchSource, ShardSpec},
};

pub use direct::DirectBackend;
pub use replicated::ReplicatedBackend;

use crate::{error::Result, loader::DeviceLoader, reduce::Combine};

/// Work run once the step that scheduled it is done, off the compute path where possible.
pub type DeferredReport = Box<dyn FnOnce() + Send + 'static>;

/// The execution capabilities a coordinator is written against.
///
/// A direct backend executes everything inline on one replica. A replicated backend runs one
/// instance per replica in lock-step: `reduce` and `step_optimizer` are barriers every replica
/// must reach in the same order.
#[allow(unused)]
#[trait_variant::make(ExecutionBackend: Send)]
pub trait LocalExecutionBackend {
    fn rank(&self) -> usize;

    fn num_replicas(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    fn device(&self) -> Device;

    /// This replica's slice of every epoch.
    fn shard(&self) -> ShardSpec;

    /// Starts a pass over this replica's batches, resuming at `start`.
    ///
    /// # Arguments
    /// * `source` - The batch factory, shared by every replica.
    /// * `start` - The first position to produce.
    fn iterate_batches(&self, source: &dyn BatchSource, start: RunPosition) -> DeviceLoader;

    /// Combines `local` with the value every other replica passes.
    async fn reduce(&self, combine: Combine, local: &[f32]) -> Vec<f32>;

    /// Applies one optimizer step to `params` using their accumulated gradients.
    ///
    /// # Errors
    /// A `Model` error if the optimizer rejects the parameters.
    async fn step_optimizer(
        &self,
        optimizer: &mut dyn Optimizer,
        params: &mut [Parameter],
    ) -> Result<()>;

    /// Runs `report` after the current step, inline or deferred depending on the backend.
    fn schedule_deferred_report(&self, report: DeferredReport);

    /// Waits for every deferred report to run.
    async fn finish(&mut self);
}
