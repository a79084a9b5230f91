use machine_learning::{
    Device, RunPosition,
    model::Parameter,
    optimization::Optimizer,
    source::{BatchSource, ShardSpec},
};

use super::{DeferredReport, ExecutionBackend};
use crate::{
    error::{Result, TrainErr},
    loader::DeviceLoader,
    reduce::Combine,
};

/// Runs a single replica synchronously on one device.
#[derive(Debug, Clone, Copy)]
pub struct DirectBackend {
    device: Device,
}

impl DirectBackend {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl ExecutionBackend for DirectBackend {
    fn rank(&self) -> usize {
        0
    }

    fn num_replicas(&self) -> usize {
        1
    }

    fn device(&self) -> Device {
        self.device
    }

    fn shard(&self) -> ShardSpec {
        ShardSpec::single()
    }

    fn iterate_batches(&self, source: &dyn BatchSource, start: RunPosition) -> DeviceLoader {
        DeviceLoader::direct(source.shard(self.shard(), start), self.device)
    }

    async fn reduce(&self, combine: Combine, local: &[f32]) -> Vec<f32> {
        combine.combine(&[local.to_vec()])
    }

    async fn step_optimizer(
        &self,
        optimizer: &mut dyn Optimizer,
        params: &mut [Parameter],
    ) -> Result<()> {
        optimizer.step(params).map_err(TrainErr::Model)
    }

    fn schedule_deferred_report(&self, report: DeferredReport) {
        report();
    }

    async fn finish(&mut self) {}
}
